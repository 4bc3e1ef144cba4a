//! String-level rewrites over session description text.

use regex::Regex;
use tracing::{debug, error, warn};

const VIDEO_START_BITRATE: &str = "x-google-start-bitrate";
const AUDIO_MAX_AVERAGE_BITRATE: &str = "maxaveragebitrate";

fn split_lines(description: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = description.split("\r\n").collect();
    while lines.last().map_or(false, |line| line.is_empty()) {
        lines.pop();
    }
    lines
}

fn join_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push_str("\r\n");
    }
    out
}

fn rtpmap_regex(codec: &str) -> Regex {
    Regex::new(&format!(
        r"(?i)^a=rtpmap:(\d+) {}(/\d+)+\r?$",
        regex::escape(codec)
    ))
    .unwrap()
}

/// Finds the first rtpmap line for `codec`. Returns the line index and payload type.
fn find_rtpmap(lines: &[&str], codec: &str) -> Option<(usize, String)> {
    let re = rtpmap_regex(codec);
    lines.iter().enumerate().find_map(|(idx, line)| {
        re.captures(line)
            .map(|captures| (idx, captures[1].to_owned()))
    })
}

/// Moves the payload type of `codec` to the front of the `m=audio` or
/// `m=video` line. Returns the input unchanged if the media line or the
/// codec is missing.
pub fn prefer_codec(description: &str, codec: &str, is_audio: bool) -> String {
    let lines = split_lines(description);
    let media_prefix = if is_audio { "m=audio " } else { "m=video " };
    let Some(m_line_index) = lines.iter().position(|line| line.starts_with(media_prefix)) else {
        warn!("No {}line, so can't prefer {}", media_prefix, codec);
        return description.to_owned();
    };
    let Some((_, payload_type)) = find_rtpmap(&lines, codec) else {
        warn!("No rtpmap for {}", codec);
        return description.to_owned();
    };
    debug!("Found {} rtpmap {}", codec, payload_type);

    let parts: Vec<&str> = lines[m_line_index].split(' ').collect();
    if parts.len() <= 3 {
        error!("Wrong SDP media description format: {}", lines[m_line_index]);
        return description.to_owned();
    }
    if !parts[3..].contains(&payload_type.as_str()) {
        warn!(
            "Payload type {} of {} is not on the {}line",
            payload_type, codec, media_prefix
        );
        return description.to_owned();
    }
    let mut new_parts: Vec<&str> = Vec::with_capacity(parts.len());
    new_parts.extend_from_slice(&parts[..3]);
    new_parts.push(&payload_type);
    new_parts.extend(parts[3..].iter().copied().filter(|pt| *pt != payload_type));
    let new_m_line = new_parts.join(" ");
    debug!("Change media description: {}", new_m_line);

    let mut out: Vec<&str> = lines.clone();
    out[m_line_index] = &new_m_line;
    join_lines(&out)
}

/// Adds (or updates) the start bitrate parameter on the fmtp line of
/// `codec`. Inserts a new fmtp line after the rtpmap if there is none.
pub fn set_start_bitrate(
    codec: &str,
    is_video: bool,
    description: &str,
    bitrate_kbps: u32,
) -> String {
    let lines = split_lines(description);
    let Some((rtpmap_index, payload_type)) = find_rtpmap(&lines, codec) else {
        warn!("No rtpmap for {} codec", codec);
        return description.to_owned();
    };
    let (name, value) = if is_video {
        (VIDEO_START_BITRATE, bitrate_kbps)
    } else {
        (AUDIO_MAX_AVERAGE_BITRATE, bitrate_kbps.saturating_mul(1000))
    };
    let param = format!("{}={}", name, value);

    let fmtp_prefix = format!("a=fmtp:{} ", payload_type);
    let mut out: Vec<String> = lines.iter().map(|line| (*line).to_owned()).collect();
    if let Some(fmtp_index) = lines.iter().position(|line| line.starts_with(&fmtp_prefix)) {
        let fmtp = &lines[fmtp_index];
        let params = fmtp[fmtp_prefix.len()..].trim_end_matches('\r');
        let mut replaced = false;
        let mut params: Vec<String> = params
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                if p.split('=').next() == Some(name) {
                    replaced = true;
                    param.clone()
                } else {
                    p.to_owned()
                }
            })
            .collect();
        if !replaced {
            params.push(param);
        }
        out[fmtp_index] = format!("{}{}", fmtp_prefix, params.join(";"));
        debug!("Update remote SDP line: {}", out[fmtp_index]);
    } else {
        let line = format!("{}{}", fmtp_prefix, param);
        debug!("Add remote SDP line: {}", line);
        out.insert(rtpmap_index + 1, line);
    }
    join_lines(&out)
}
