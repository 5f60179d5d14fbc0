//! JSON app-card extraction.
//!
//! Platform cards arrive as an embedded JSON document with an `app` code
//! and a `meta` blob whose shape differs per application. Each known code
//! maps to a text extraction; several also download a preview image. The
//! fallback is the card's own `prompt` or a generic placeholder.

use crate::inbound::face_codes::face_name;
use crate::inbound::fetch::fetch_base64;
use crate::message::{MiniappCardData, MusicCardData, Seg};

use base64::Engine;
use serde_json::Value;
use tracing::{error, warn};

const CARD_FALLBACK: &str = "[卡片消息]";

/// Extract segments from the raw JSON string carried by a `json` segment.
pub async fn extract_card(client: &reqwest::Client, json_data: &str) -> Vec<Seg> {
    let parsed: Value = match serde_json::from_str(json_data) {
        Ok(v) => v,
        Err(_) => {
            warn!("card JSON failed to parse");
            return vec![Seg::text(CARD_FALLBACK)];
        }
    };
    let app = parsed.get("app").and_then(|a| a.as_str()).unwrap_or("");
    let meta = parsed.get("meta").cloned().unwrap_or(Value::Null);

    match app {
        "com.tencent.mannounce" => announcement(&meta),
        "com.tencent.music.lua" | "com.tencent.structmsg" => music_card(&meta)
            .unwrap_or_else(|| prompt_fallback(&parsed)),
        "com.tencent.miniapp_01" => match miniapp(client, &meta).await {
            Some(segs) => segs,
            None => prompt_fallback(&parsed),
        },
        "com.tencent.giftmall.giftark" => gift(&meta).unwrap_or_else(|| prompt_fallback(&parsed)),
        "com.tencent.contact.lua" => contact(&meta, "推荐联系人", "未知联系人"),
        "com.tencent.troopsharecard" => contact(&meta, "推荐群聊", "未知群聊"),
        "com.tencent.tuwen.lua" => news_share(client, &meta).await,
        "com.tencent.feed.lua" => feed_share(client, &meta).await,
        "com.tencent.template.qqfavorite.share" => favorite_share(client, &meta).await,
        "com.tencent.miniapp.lua" => zone_share(client, &meta).await,
        "com.tencent.forum" => match forum_post(client, &meta).await {
            Some(segs) => segs,
            None => prompt_fallback(&parsed),
        },
        "com.tencent.map" => location(&meta),
        "com.tencent.together" => listen_together(&meta),
        _ => prompt_fallback(&parsed),
    }
}

fn prompt_fallback(parsed: &Value) -> Vec<Seg> {
    let prompt = parsed
        .get("prompt")
        .and_then(|p| p.as_str())
        .unwrap_or(CARD_FALLBACK);
    vec![Seg::text(prompt)]
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

/// Group announcement. Title and text may be base64-encoded (`encode == 1`).
fn announcement(meta: &Value) -> Vec<Seg> {
    let mannounce = meta.get("mannounce").cloned().unwrap_or(Value::Null);
    let mut title = str_field(&mannounce, "title").to_string();
    let mut text = str_field(&mannounce, "text").to_string();
    if mannounce.get("encode").and_then(|e| e.as_i64()) == Some(1) {
        let b64 = base64::engine::general_purpose::STANDARD;
        if !title.is_empty() {
            match b64.decode(&title) {
                Ok(bytes) => title = String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => warn!("announcement title base64 decode failed: {e}"),
            }
        }
        if !text.is_empty() {
            match b64.decode(&text) {
                Ok(bytes) => text = String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => warn!("announcement text base64 decode failed: {e}"),
            }
        }
    }
    let content = match (title.is_empty(), text.is_empty()) {
        (false, false) => format!("[{title}]:{text}"),
        (false, true) => format!("[{title}]"),
        (true, false) => text,
        (true, true) => "[群公告]".to_string(),
    };
    vec![Seg::text(content)]
}

fn music_card(meta: &Value) -> Option<Vec<Seg>> {
    let music = meta.get("music")?;
    let singer = {
        let desc = str_field(music, "desc");
        if desc.is_empty() {
            str_field(music, "singer")
        } else {
            desc
        }
    };
    let jump_url = {
        let a = str_field(music, "jumpUrl");
        if a.is_empty() {
            str_field(music, "jump_url")
        } else {
            a
        }
    };
    let music_url = {
        let a = str_field(music, "musicUrl");
        if a.is_empty() {
            str_field(music, "music_url")
        } else {
            a
        }
    };
    Some(vec![Seg::MusicCard(MusicCardData {
        title: str_field(music, "title").to_string(),
        singer: singer.to_string(),
        jump_url: jump_url.to_string(),
        music_url: music_url.to_string(),
        tag: str_field(music, "tag").to_string(),
        preview: str_field(music, "preview").to_string(),
    })])
}

/// Mini-app share card; downloads the preview image when present.
async fn miniapp(client: &reqwest::Client, meta: &Value) -> Option<Vec<Seg>> {
    let detail = meta.get("detail_1")?;
    let preview = str_field(detail, "preview").to_string();
    let mut segs = vec![Seg::MiniappCard(MiniappCardData {
        title: str_field(detail, "title").to_string(),
        desc: str_field(detail, "desc").to_string(),
        url: str_field(detail, "url").to_string(),
        source_url: str_field(detail, "qqdocurl").to_string(),
        preview: preview.clone(),
        icon: str_field(detail, "icon").to_string(),
    })];
    if !preview.is_empty() {
        match fetch_base64(client, &preview).await {
            Ok(encoded) => segs.push(Seg::Image(encoded)),
            Err(e) => error!("mini-app preview download failed: {e}"),
        }
    }
    Some(segs)
}

fn gift(meta: &Value) -> Option<Vec<Seg>> {
    let giftark = meta.get("giftark")?;
    let name = {
        let title = str_field(giftark, "title");
        if title.is_empty() {
            "礼物"
        } else {
            title
        }
    };
    let desc = str_field(giftark, "desc");
    let mut text = format!("[赠送礼物: {name}]");
    if !desc.is_empty() {
        text.push('\n');
        text.push_str(desc);
    }
    Some(vec![Seg::text(text)])
}

fn contact(meta: &Value, default_tag: &str, default_name: &str) -> Vec<Seg> {
    let contact = meta.get("contact").cloned().unwrap_or(Value::Null);
    let name = {
        let n = str_field(&contact, "nickname");
        if n.is_empty() {
            default_name
        } else {
            n
        }
    };
    let tag = {
        let t = str_field(&contact, "tag");
        if t.is_empty() {
            default_tag
        } else {
            t
        }
    };
    vec![Seg::text(format!("[{tag}] {name}"))]
}

fn strip_tag_prefix(title: &str, tag: &str) -> String {
    if !tag.is_empty() && title.contains(tag) {
        title
            .replacen(tag, "", 1)
            .trim_matches(|c: char| "：: -— ".contains(c))
            .to_string()
    } else {
        title.to_string()
    }
}

/// Image-text share (video sites, web pages, curated group digests).
async fn news_share(client: &reqwest::Client, meta: &Value) -> Vec<Seg> {
    let news = meta.get("news").cloned().unwrap_or(Value::Null);
    let tag = {
        let t = str_field(&news, "tag");
        if t.is_empty() {
            "图文分享"
        } else {
            t
        }
    };
    let title = {
        let t = str_field(&news, "title");
        if t.is_empty() {
            "未知标题"
        } else {
            t
        }
    };
    let desc = str_field(&news, "desc").replace("[图片]", "");
    let title = strip_tag_prefix(title, tag);
    let mut segs = vec![Seg::text(format!("[{tag}] {title}:{}", desc.trim()))];
    append_preview(client, &mut segs, str_field(&news, "preview")).await;
    segs
}

/// Group album share.
async fn feed_share(client: &reqwest::Client, meta: &Value) -> Vec<Seg> {
    let feed = meta.get("feed").cloned().unwrap_or(Value::Null);
    let tag = {
        let t = str_field(&feed, "tagName");
        if t.is_empty() {
            "群相册"
        } else {
            t
        }
    };
    let title = {
        let t = str_field(&feed, "title");
        if t.is_empty() {
            "群相册"
        } else {
            t
        }
    };
    let desc = str_field(&feed, "forwardMessage");
    let title = strip_tag_prefix(title, tag);
    let mut segs = vec![Seg::text(format!("[{tag}] {title}:{desc}"))];
    append_preview(client, &mut segs, str_field(&feed, "cover")).await;
    segs
}

async fn favorite_share(client: &reqwest::Client, meta: &Value) -> Vec<Seg> {
    let news = meta.get("news").cloned().unwrap_or(Value::Null);
    let desc = str_field(&news, "desc").replace("[图片]", "");
    let tag = {
        let t = str_field(&news, "tag");
        if t.is_empty() {
            "QQ收藏"
        } else {
            t
        }
    };
    let mut segs = vec![Seg::text(format!("[{tag}] {}", desc.trim()))];
    append_preview(client, &mut segs, str_field(&news, "preview")).await;
    segs
}

async fn zone_share(client: &reqwest::Client, meta: &Value) -> Vec<Seg> {
    let miniapp = meta.get("miniapp").cloned().unwrap_or(Value::Null);
    let title = {
        let t = str_field(&miniapp, "title");
        if t.is_empty() {
            "未知标题"
        } else {
            t
        }
    };
    let tag = {
        let t = str_field(&miniapp, "tag");
        if t.is_empty() {
            "QQ空间"
        } else {
            t
        }
    };
    let mut segs = vec![Seg::text(format!("[{tag}] {title}"))];
    append_preview(client, &mut segs, str_field(&miniapp, "preview")).await;
    segs
}

/// Channel post share; downloads every attached image.
async fn forum_post(client: &reqwest::Client, meta: &Value) -> Option<Vec<Seg>> {
    let detail = meta.get("detail")?;
    let feed = detail.get("feed").cloned().unwrap_or(Value::Null);
    let guild_name = str_field(
        &detail.get("channel_info").cloned().unwrap_or(Value::Null),
        "guild_name",
    )
    .to_string();
    let nick = {
        let poster = detail.get("poster").cloned().unwrap_or(Value::Null);
        let n = str_field(&poster, "nick").to_string();
        if n.is_empty() {
            "QQ用户".to_string()
        } else {
            n
        }
    };
    let title = feed
        .pointer("/title/contents/0/text_content/text")
        .and_then(|t| t.as_str())
        .unwrap_or("帖子")
        .to_string();

    // Inline reactions in the body render through the face table.
    let mut face_content = String::new();
    if let Some(contents) = feed.pointer("/contents/contents").and_then(|c| c.as_array()) {
        for item in contents {
            if let Some(id) = item.pointer("/emoji_content/id").and_then(|i| i.as_str()) {
                if let Some(name) = face_name(id) {
                    face_content.push_str(name);
                }
            }
        }
    }

    let mut segs = vec![Seg::text(format!(
        "[频道帖子] [{guild_name}]{nick}:{title}{face_content}"
    ))];

    if let Some(images) = feed.get("images").and_then(|i| i.as_array()) {
        for image in images {
            let Some(url) = image.get("pic_url").and_then(|u| u.as_str()) else {
                continue;
            };
            match fetch_base64(client, url).await {
                Ok(encoded) => segs.push(Seg::Image(encoded)),
                Err(e) => error!("channel post image download failed: {e}"),
            }
        }
    }
    Some(segs)
}

fn location(meta: &Value) -> Vec<Seg> {
    let loc = meta.get("Location.Search").cloned().unwrap_or(Value::Null);
    let name = {
        let n = str_field(&loc, "name");
        if n.is_empty() {
            "未知地点"
        } else {
            n
        }
    };
    let address = str_field(&loc, "address");
    vec![Seg::text(format!("[位置] {address} · {name}"))]
}

fn listen_together(meta: &Value) -> Vec<Seg> {
    let invite = meta.get("invite").cloned().unwrap_or(Value::Null);
    let title = {
        let t = str_field(&invite, "title");
        if t.is_empty() {
            "一起听歌"
        } else {
            t
        }
    };
    let summary = str_field(&invite, "summary");
    vec![Seg::text(format!("[{title}] {summary}"))]
}

async fn append_preview(client: &reqwest::Client, segs: &mut Vec<Seg>, url: &str) {
    if url.is_empty() {
        return;
    }
    match fetch_base64(client, url).await {
        Ok(encoded) => segs.push(Seg::Image(encoded)),
        Err(e) => error!("card preview download failed: {e}"),
    }
}
