use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use derive_new::new;
use tokio::{spawn, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::{FrameError, TelemetryError},
    frame::{
        is_request, ApiCode, DataType, DcFrame, DcRequest, DcResponse, ResponseCode, Role,
        Subscribe, HEADER_LEN,
    },
};

#[derive(Clone, Debug, PartialEq, Eq, new)]
pub struct TelemetryPayload {
    pub data_type: DataType,
    pub data: Bytes,
}

impl TelemetryPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(DataType::String, Bytes::from(text.into()))
    }
}

/// Device telemetry served over the data channel.
#[async_trait]
pub trait TelemetryService: Send + Sync {
    async fn handle(
        &self,
        api: ApiCode,
        request: &DcRequest,
    ) -> Result<TelemetryPayload, TelemetryError>;

    /// Starts a stream of unsolicited payloads for `api`. The stream stops
    /// when the receiver is dropped.
    fn subscribe(
        &self,
        api: ApiCode,
    ) -> Result<mpsc::UnboundedReceiver<TelemetryPayload>, TelemetryError>;
}

/// Answers data-channel requests and pushes subscribed telemetry.
pub struct DataChannelRouter {
    role: Role,
    service: Arc<dyn TelemetryService>,
    outbound: mpsc::UnboundedSender<Bytes>,
    subscriptions: HashMap<u8, JoinHandle<()>>,
}

impl DataChannelRouter {
    pub fn new(
        role: Role,
        service: Arc<dyn TelemetryService>,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        Self {
            role,
            service,
            outbound,
            subscriptions: HashMap::new(),
        }
    }

    fn send(&self, response: DcResponse) {
        if self.outbound.send(response.encode()).is_err() {
            debug!("data channel is gone");
        }
    }

    /// Never waits on the telemetry service; answers go out from spawned tasks.
    pub fn on_message(&mut self, buf: &[u8]) {
        match DcFrame::decode(buf) {
            Ok(DcFrame::Request(request)) => self.on_request(request),
            Ok(DcFrame::Response(response)) => {
                debug!(
                    "response api={} session={} code={:?} ({} bytes)",
                    response.api_code(),
                    response.session_id(),
                    response.response_code(),
                    response.payload().len()
                );
            }
            Err(FrameError::TooShort { len }) => warn!("drop {} byte frame", len),
            Err(err) if buf.len() >= HEADER_LEN && is_request(buf) => {
                warn!("malformed request: {}", err);
                self.send(
                    DcResponse::builder()
                        .version(buf[0])
                        .from(self.role)
                        .api_code(buf[2])
                        .session_id(buf[5])
                        .response_code(ResponseCode::FailDecodeParam)
                        .build(),
                );
            }
            Err(err) => warn!("malformed response: {}", err),
        }
    }

    fn on_request(&mut self, request: DcRequest) {
        debug!(
            "request api={} session={} subscribe={:?}",
            request.api_code(),
            request.session_id(),
            request.subscribe()
        );
        if request.subscribe() == Subscribe::Unregister {
            self.unregister(request.session_id());
            return;
        }
        let Some(api) = ApiCode::from_byte(request.api_code()) else {
            warn!("unknown api code: {}", request.api_code());
            self.send(
                DcResponse::reply_to(&request)
                    .from(self.role)
                    .response_code(ResponseCode::FailUnknownApiType)
                    .build(),
            );
            return;
        };
        match request.subscribe() {
            Subscribe::Register => self.register(api, &request),
            _ => self.answer(api, request),
        }
    }

    fn answer(&self, api: ApiCode, request: DcRequest) {
        let service = self.service.clone();
        let role = self.role;
        let outbound = self.outbound.clone();
        spawn(async move {
            let result = service.handle(api, &request).await;
            if outbound.send(respond(role, &request, result).encode()).is_err() {
                debug!("data channel is gone");
            }
        });
    }

    fn register(&mut self, api: ApiCode, request: &DcRequest) {
        let session_id = request.session_id();
        if let Some(task) = self.subscriptions.get(&session_id) {
            if !task.is_finished() {
                debug!("session {} is already subscribed", session_id);
                return;
            }
        }
        let mut payloads = match self.service.subscribe(api) {
            Ok(payloads) => payloads,
            Err(err) => {
                self.send(respond(self.role, request, Err(err)));
                return;
            }
        };
        info!("subscribe {:?} for session {}", api, session_id);
        let request = request.clone();
        let role = self.role;
        let outbound = self.outbound.clone();
        let task = spawn(async move {
            while let Some(payload) = payloads.recv().await {
                let response = DcResponse::reply_to(&request)
                    .from(role)
                    .data_type(payload.data_type)
                    .payload(payload.data)
                    .build();
                if outbound.send(response.encode()).is_err() {
                    return;
                }
            }
        });
        self.subscriptions.insert(session_id, task);
    }

    fn unregister(&mut self, session_id: u8) {
        match self.subscriptions.remove(&session_id) {
            Some(task) => {
                info!("unsubscribe session {}", session_id);
                task.abort();
            }
            None => debug!("session {} is not subscribed", session_id),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    pub fn close(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }
}

fn respond(
    role: Role,
    request: &DcRequest,
    result: Result<TelemetryPayload, TelemetryError>,
) -> DcResponse {
    let builder = DcResponse::reply_to(request).from(role);
    match result {
        Ok(payload) => builder
            .data_type(payload.data_type)
            .payload(payload.data)
            .build(),
        Err(err) => {
            warn!("api {} failed: {}", request.api_code(), err);
            builder.response_code(ResponseCode::FailUnknown).build()
        }
    }
}

impl Drop for DataChannelRouter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use tokio::time::{sleep, timeout};

    use super::*;

    #[derive(Default)]
    struct TestTelemetry {
        state: Mutex<Vec<mpsc::UnboundedSender<TelemetryPayload>>>,
        subscribed: AtomicUsize,
    }

    impl TestTelemetry {
        fn push(&self, text: &str) -> bool {
            let state = self.state.lock().unwrap();
            state
                .iter()
                .filter(|tx| tx.send(TelemetryPayload::text(text)).is_ok())
                .count()
                > 0
        }
    }

    #[async_trait]
    impl TelemetryService for TestTelemetry {
        async fn handle(
            &self,
            api: ApiCode,
            _request: &DcRequest,
        ) -> Result<TelemetryPayload, TelemetryError> {
            match api {
                ApiCode::DeviceInfo => Ok(TelemetryPayload::text(r#"{"os":"test"}"#)),
                ApiCode::DeviceState => {
                    sleep(Duration::from_secs(10)).await;
                    Ok(TelemetryPayload::text("late"))
                }
                _ => Err(TelemetryError::Unsupported(api.to_byte())),
            }
        }

        fn subscribe(
            &self,
            api: ApiCode,
        ) -> Result<mpsc::UnboundedReceiver<TelemetryPayload>, TelemetryError> {
            if api != ApiCode::DeviceState {
                return Err(TelemetryError::Unsupported(api.to_byte()));
            }
            self.subscribed.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            self.state.lock().unwrap().push(tx);
            Ok(rx)
        }
    }

    fn router() -> (
        DataChannelRouter,
        Arc<TestTelemetry>,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        let telemetry = Arc::new(TestTelemetry::default());
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            DataChannelRouter::new(Role::Mobile, telemetry.clone(), outbound),
            telemetry,
            rx,
        )
    }

    fn request(api_code: u8, subscribe: Subscribe, session_id: u8) -> Bytes {
        DcRequest::builder()
            .from(Role::Web)
            .api_code(api_code)
            .subscribe(subscribe)
            .session_id(session_id)
            .build()
            .encode()
    }

    async fn next_response(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> (Bytes, DcResponse) {
        let bytes = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let response = DcResponse::try_from(DcFrame::decode(&bytes).unwrap()).unwrap();
        (bytes, response)
    }

    #[tokio::test]
    async fn state_subscription_pushes_until_unregistered() {
        let (mut router, telemetry, mut rx) = router();
        router.on_message(&request(1, Subscribe::Register, 5));
        assert_eq!(router.subscription_count(), 1);

        assert!(telemetry.push(r#"{"battery":80}"#));
        assert!(telemetry.push(r#"{"battery":79}"#));
        for expected in [r#"{"battery":80}"#, r#"{"battery":79}"#] {
            let (bytes, response) = next_response(&mut rx).await;
            assert_ne!(bytes[1] & 0x80, 0);
            assert_eq!(response.session_id(), 5);
            assert_eq!(response.from(), Role::Mobile);
            assert_eq!(response.api_code(), 1);
            assert_eq!(response.response_code(), ResponseCode::Success);
            assert_eq!(response.payload().as_ref(), expected.as_bytes());
        }

        router.on_message(&request(1, Subscribe::Unregister, 5));
        assert_eq!(router.subscription_count(), 0);
        telemetry.push(r#"{"battery":78}"#);
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_register_keeps_the_first_subscription() {
        let (mut router, telemetry, _rx) = router();
        router.on_message(&request(1, Subscribe::Register, 5));
        router.on_message(&request(1, Subscribe::Register, 5));
        assert_eq!(telemetry.subscribed.load(Ordering::SeqCst), 1);
        assert_eq!(router.subscription_count(), 1);

        router.on_message(&request(1, Subscribe::Register, 6));
        assert_eq!(router.subscription_count(), 2);
        router.close();
        assert_eq!(router.subscription_count(), 0);
    }

    #[tokio::test]
    async fn unknown_api_code_gets_one_failure() {
        let (mut router, _telemetry, mut rx) = router();
        router.on_message(&request(42, Subscribe::None, 3));
        let (_, response) = next_response(&mut rx).await;
        assert_eq!(response.response_code(), ResponseCode::FailUnknownApiType);
        assert_eq!(response.api_code(), 42);
        assert_eq!(response.session_id(), 3);
        assert!(response.payload().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_shot_request_and_rejections() {
        let (mut router, _telemetry, mut rx) = router();
        router.on_message(&request(0, Subscribe::None, 1));
        let (_, response) = next_response(&mut rx).await;
        assert_eq!(response.response_code(), ResponseCode::Success);
        assert_eq!(response.data_type(), DataType::String);
        assert_eq!(response.payload().as_ref(), br#"{"os":"test"}"#);

        router.on_message(&request(2, Subscribe::None, 2));
        let (_, response) = next_response(&mut rx).await;
        assert_eq!(response.response_code(), ResponseCode::FailUnknown);
        assert_eq!(response.api_code(), 2);
    }

    #[tokio::test]
    async fn slow_request_does_not_delay_the_next_one() {
        let (mut router, _telemetry, mut rx) = router();
        router.on_message(&request(1, Subscribe::None, 1));
        router.on_message(&request(0, Subscribe::None, 2));
        let (_, response) = next_response(&mut rx).await;
        assert_eq!(response.session_id(), 2);
        assert_eq!(response.response_code(), ResponseCode::Success);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frames() {
        let (mut router, _telemetry, mut rx) = router();
        router.on_message(&[1, 2, 0]);
        assert!(rx.try_recv().is_err());

        router.on_message(&[1, 2, 0, 9, 1, 7, 0]);
        let (_, response) = next_response(&mut rx).await;
        assert_eq!(response.response_code(), ResponseCode::FailDecodeParam);
        assert_eq!(response.session_id(), 7);

        let response = DcResponse::builder().session_id(1).build().encode();
        router.on_message(&response);
        assert!(rx.try_recv().is_err());
    }
}
