//! Internal segment tree → gateway outbound payload.
//!
//! Walks the outgoing tree recursively and emits the gateway's segment
//! dialect. Two payload-level rules live here: a reply segment always heads
//! the payload (keeping only the last one seen), and forward nodes are
//! never combined with other segments.

use crate::message::{FileData, MessageBase, MusicData, Seg};

use base64::Engine;
use image::codecs::gif::GifEncoder;
use image::{Frame, ImageFormat};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

/// Build the gateway payload for one outgoing segment tree.
pub fn build_payload(segment: &Seg, use_tts: bool) -> Vec<Value> {
    process_recursive(segment, false, use_tts)
}

fn process_recursive(segment: &Seg, in_forward: bool, use_tts: bool) -> Vec<Value> {
    let mut payload = Vec::new();
    match segment {
        Seg::Seglist(children) => {
            for child in children {
                payload = process_by_type(child, payload, in_forward, use_tts);
            }
        }
        other => payload = process_by_type(other, payload, in_forward, use_tts),
    }
    payload
}

fn process_by_type(
    segment: &Seg,
    payload: Vec<Value>,
    in_forward: bool,
    use_tts: bool,
) -> Vec<Value> {
    match segment {
        Seg::Reply(id) => {
            let id_text = id.as_text();
            // Synthesized notices have no real message to reply to.
            if id_text == "notice" {
                return payload;
            }
            push_reply(payload, json!({"type": "reply", "data": {"id": id_text}}))
        }
        Seg::Text(text) => {
            if text.is_empty() {
                return payload;
            }
            push(payload, json!({"type": "text", "data": {"text": text}}))
        }
        Seg::Face(id) => match id.as_i64() {
            Some(id) => push(payload, json!({"type": "face", "data": {"id": id}})),
            None => {
                warn!("face id is not numeric, skipped");
                payload
            }
        },
        Seg::Image(encoded) => push(
            payload,
            json!({
                "type": "image",
                "data": {"file": format!("base64://{encoded}"), "subtype": 0},
            }),
        ),
        Seg::Emoji(encoded) => {
            let encoded = ensure_gif(encoded);
            push(
                payload,
                json!({
                    "type": "image",
                    "data": {
                        "file": format!("base64://{encoded}"),
                        "subtype": 1,
                        "summary": "[动画表情]",
                    },
                }),
            )
        }
        Seg::Voice(encoded) => {
            if !use_tts {
                warn!("voice output is disabled, segment skipped");
                return payload;
            }
            if encoded.is_empty() {
                return payload;
            }
            push(
                payload,
                json!({"type": "record", "data": {"file": format!("base64://{encoded}")}}),
            )
        }
        Seg::VoiceUrl(url) => push(payload, json!({"type": "record", "data": {"file": url}})),
        Seg::Music(music) => match music_entry(music) {
            Some(entry) => push(payload, entry),
            None => payload,
        },
        Seg::VideoUrl(url) => push(payload, json!({"type": "video", "data": {"file": url}})),
        Seg::ImageUrl(url) => push(payload, json!({"type": "image", "data": {"file": url}})),
        Seg::Video(encoded) => {
            if encoded.is_empty() {
                error!("video payload is empty, skipped");
                return payload;
            }
            push(
                payload,
                json!({"type": "video", "data": {"file": format!("base64://{encoded}")}}),
            )
        }
        Seg::File(file) => match file_entry(file) {
            Some(entry) => push(payload, entry),
            None => payload,
        },
        Seg::Forward(items) if !in_forward => {
            // Forward nodes replace everything else in the payload.
            items.iter().map(forward_node).collect()
        }
        other => {
            debug!(kind = other.kind(), "segment kind not sent to the gateway");
            payload
        }
    }
}

fn push(mut payload: Vec<Value>, entry: Value) -> Vec<Value> {
    payload.push(entry);
    payload
}

/// Replies always land at the head; the newest reply wins.
fn push_reply(payload: Vec<Value>, entry: Value) -> Vec<Value> {
    let mut rebuilt = Vec::with_capacity(payload.len() + 1);
    rebuilt.push(entry);
    for existing in payload {
        if existing.get("type").and_then(|t| t.as_str()) == Some("reply") {
            debug!("multiple replies in one payload, keeping the newest");
            continue;
        }
        rebuilt.push(existing);
    }
    rebuilt
}

fn music_entry(music: &MusicData) -> Option<Value> {
    match music {
        MusicData::SongId(id) => Some(json!({
            "type": "music",
            "data": {"type": "163", "id": id},
        })),
        MusicData::Platform(platform) => {
            let source = if matches!(platform.platform.as_str(), "163" | "qq") {
                platform.platform.clone()
            } else {
                warn!(platform = %platform.platform, "unsupported music platform, defaulting to 163");
                "163".to_string()
            };
            let id = match &platform.id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(json!({"type": "music", "data": {"type": source, "id": id}}))
        }
    }
}

fn file_entry(file: &FileData) -> Option<Value> {
    match file {
        FileData::Path(path) => Some(json!({
            "type": "file",
            "data": {"file": format!("file://{path}")},
        })),
        FileData::Detail(detail) => {
            let file_ref = match (&detail.file, &detail.path, &detail.url) {
                (Some(file), _, _) => with_scheme(file),
                (None, Some(path), _) => format!("file://{path}"),
                (None, None, Some(url)) => url.clone(),
                (None, None, None) => {
                    warn!("file segment without file/path/url, skipped");
                    return None;
                }
            };
            let mut data = json!({"file": file_ref});
            if let Some(name) = &detail.name {
                data["name"] = json!(name);
            }
            if let Some(thumb) = &detail.thumb {
                data["thumb"] = json!(thumb);
            }
            Some(json!({"type": "file", "data": data}))
        }
    }
}

/// Local paths get a `file://` scheme; anything already carrying a scheme
/// passes through.
fn with_scheme(file: &str) -> String {
    const SCHEMES: [&str; 4] = ["file://", "http://", "https://", "base64://"];
    if SCHEMES.iter().any(|scheme| file.starts_with(scheme)) {
        file.to_string()
    } else {
        format!("file://{file}")
    }
}

/// One forward node: a bare message id, or named inline content.
fn forward_node(item: &MessageBase) -> Value {
    if let Seg::Id(id) = &item.message_segment {
        return json!({"type": "node", "data": {"id": id.as_text()}});
    }
    let user = item.message_info.user_info.as_ref();
    let name = user
        .and_then(|u| u.user_nickname.clone())
        .unwrap_or_else(|| "QQ用户".to_string());
    let uin = user.map(|u| u.user_id).unwrap_or(0);
    let content = process_recursive(&item.message_segment, true, false);
    json!({
        "type": "node",
        "data": {"name": name, "uin": uin, "content": content},
    })
}

/// Animated stickers must be GIFs; re-encode other formats.
fn ensure_gif(encoded: &str) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    let Ok(bytes) = engine.decode(encoded) else {
        warn!("sticker payload is not valid base64, sent as-is");
        return encoded.to_string();
    };
    if image::guess_format(&bytes).map(|f| f == ImageFormat::Gif).unwrap_or(false) {
        return encoded.to_string();
    }
    let Ok(decoded) = image::load_from_memory(&bytes) else {
        warn!("sticker payload is not a decodable image, sent as-is");
        return encoded.to_string();
    };
    let mut gif_bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut gif_bytes);
        if let Err(e) = encoder.encode_frame(Frame::new(decoded.to_rgba8())) {
            warn!("GIF conversion failed, sticker sent as-is: {e}");
            return encoded.to_string();
        }
    }
    engine.encode(gif_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        FileDetail, IntOrString, MessageId, MessageInfo, MusicPlatform, UserInfo,
    };
    use pretty_assertions::assert_eq;

    #[test]
    fn reply_is_moved_to_head_and_last_wins() {
        let tree = Seg::seglist(vec![
            Seg::text("hello"),
            Seg::Reply(IntOrString::Num(1)),
            Seg::text("world"),
            Seg::Reply(IntOrString::Num(2)),
        ]);
        let payload = build_payload(&tree, false);
        assert_eq!(payload[0]["type"], "reply");
        assert_eq!(payload[0]["data"]["id"], "2");
        let replies = payload
            .iter()
            .filter(|e| e["type"] == "reply")
            .count();
        assert_eq!(replies, 1);
        assert_eq!(payload.len(), 3);
    }

    #[test]
    fn notice_reply_is_dropped() {
        let tree = Seg::seglist(vec![Seg::Reply("notice".into()), Seg::text("x")]);
        let payload = build_payload(&tree, false);
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0]["type"], "text");
    }

    #[test]
    fn voice_requires_tts() {
        let tree = Seg::Voice("QUJD".into());
        assert!(build_payload(&tree, false).is_empty());
        let payload = build_payload(&tree, true);
        assert_eq!(payload[0]["type"], "record");
        assert_eq!(payload[0]["data"]["file"], "base64://QUJD");
    }

    #[test]
    fn music_accepts_both_forms() {
        let bare = build_payload(&Seg::Music(MusicData::SongId("123".into())), false);
        assert_eq!(bare[0]["data"], json!({"type": "163", "id": "123"}));

        let qq = build_payload(
            &Seg::Music(MusicData::Platform(MusicPlatform {
                platform: "qq".into(),
                id: json!(456),
            })),
            false,
        );
        assert_eq!(qq[0]["data"], json!({"type": "qq", "id": "456"}));

        let unknown = build_payload(
            &Seg::Music(MusicData::Platform(MusicPlatform {
                platform: "spotify".into(),
                id: json!("9"),
            })),
            false,
        );
        assert_eq!(unknown[0]["data"]["type"], "163");
    }

    #[test]
    fn file_paths_gain_scheme() {
        let bare = build_payload(&Seg::File(FileData::Path("/tmp/a.txt".into())), false);
        assert_eq!(bare[0]["data"]["file"], "file:///tmp/a.txt");

        let detail = build_payload(
            &Seg::File(FileData::Detail(FileDetail {
                file: Some("https://x/a.txt".into()),
                name: Some("a.txt".into()),
                ..FileDetail::default()
            })),
            false,
        );
        assert_eq!(detail[0]["data"]["file"], "https://x/a.txt");
        assert_eq!(detail[0]["data"]["name"], "a.txt");
    }

    fn forward_item(seg: Seg, nickname: Option<&str>) -> MessageBase {
        MessageBase {
            message_info: MessageInfo {
                platform: "qq".into(),
                message_id: MessageId::Num(1),
                time: 0.0,
                user_info: nickname.map(|n| UserInfo {
                    platform: "qq".into(),
                    user_id: 5,
                    user_nickname: Some(n.into()),
                    user_cardname: None,
                }),
                group_info: None,
                template_info: None,
                format_info: None,
                additional_config: None,
            },
            message_segment: seg,
            raw_message: None,
        }
    }

    #[test]
    fn forward_replaces_payload_with_nodes() {
        let tree = Seg::seglist(vec![
            Seg::text("ignored"),
            Seg::Forward(vec![
                forward_item(Seg::Id(IntOrString::Num(77)), None),
                forward_item(Seg::text("inner"), Some("amy")),
            ]),
        ]);
        let payload = build_payload(&tree, false);
        assert_eq!(payload.len(), 2);
        assert_eq!(payload[0]["data"]["id"], "77");
        assert_eq!(payload[1]["data"]["name"], "amy");
        assert_eq!(payload[1]["data"]["uin"], 5);
        assert_eq!(payload[1]["data"]["content"][0]["type"], "text");
    }

    #[test]
    fn sticker_png_converts_to_gif() {
        // 1x1 PNG pixel.
        let mut png_bytes = Vec::new();
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([255, 0, 0, 255]));
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut png_bytes), ImageFormat::Png)
            .unwrap();
        let engine = base64::engine::general_purpose::STANDARD;
        let encoded = engine.encode(&png_bytes);

        let converted = ensure_gif(&encoded);
        let out = engine.decode(&converted).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Gif);
    }

    #[test]
    fn sticker_gif_passes_through() {
        let mut gif_bytes = Vec::new();
        {
            let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([0, 255, 0, 255]));
            let mut encoder = GifEncoder::new(&mut gif_bytes);
            encoder.encode_frame(Frame::new(img)).unwrap();
        }
        let engine = base64::engine::general_purpose::STANDARD;
        let encoded = engine.encode(&gif_bytes);
        assert_eq!(ensure_gif(&encoded), encoded);
    }
}
