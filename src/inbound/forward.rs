//! Forward-message translation.
//!
//! A forward message nests previously-sent messages, possibly containing
//! further forwards. The tree is built synchronously with image leaves
//! holding their URLs, then a second pass either resolves every image to
//! base64 or collapses it to a text placeholder, depending on how many
//! images the tree carries. That switch keeps huge albums from blowing up
//! downstream multimodal consumers.

use crate::inbound::fetch::fetch_base64;
use crate::message::Seg;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{error, trace, warn};

/// Nesting cap; deeper forwards render a placeholder.
pub const FORWARD_MAX_DEPTH: usize = 16;

const HEADER: &str = "========== 转发消息开始 ==========\n";
const FOOTER: &str = "========== 转发消息结束 ==========";

/// Translate a fetched forward manifest (`messages` array) into one segment.
pub async fn handle_forward(
    client: &reqwest::Client,
    image_threshold: usize,
    messages: &[Value],
) -> Option<Seg> {
    let (tree, image_count) = build_tree(messages, 0);
    let tree = tree?;

    let header = Seg::text(HEADER);
    let footer = Seg::text(FOOTER);

    let body = if image_count > 0 && image_count < image_threshold {
        trace!(image_count, "below threshold, resolving forward images to base64");
        resolve_images(client, tree, true).await
    } else if image_count > 0 {
        trace!(image_count, "at or above threshold, collapsing forward images");
        resolve_images(client, tree, false).await
    } else {
        trace!("forward carries no images");
        tree
    };

    Some(Seg::seglist(vec![header, body, footer]))
}

/// Build the layered text tree. Image leaves keep their URLs for the
/// resolution pass; the second element of the pair counts them.
fn build_tree(messages: &[Value], layer: usize) -> (Option<Seg>, usize) {
    if layer >= FORWARD_MAX_DEPTH {
        return (Some(Seg::text("[嵌套过深]")), 0);
    }

    let indent = "--".repeat(layer);
    let mut seg_list = vec![Seg::text(format!("{indent}\n【转发消息】\n"))];
    let mut image_count = 0usize;

    for sub_message in messages {
        let nickname = sub_message
            .pointer("/sender/nickname")
            .and_then(|n| n.as_str())
            .unwrap_or("QQ用户");
        let label = format!("【{nickname}】:");

        let Some(content) = sub_message.get("message").and_then(|m| m.as_array()) else {
            warn!("forward entry without content, skipped");
            continue;
        };
        let Some(first) = content.first() else {
            warn!("forward entry without content, skipped");
            continue;
        };
        let data = first.get("data").cloned().unwrap_or(Value::Null);

        match first.get("type").and_then(|t| t.as_str()) {
            Some("forward") => {
                let Some(inner) = data.get("content").and_then(|c| c.as_array()) else {
                    continue;
                };
                let (child, count) = build_tree(inner, layer + 1);
                image_count += count;
                let head = Seg::text(format!("{indent}【{nickname}】: 合并转发消息内容：\n"));
                let mut entry = vec![head];
                if let Some(child) = child {
                    entry.push(child);
                }
                seg_list.push(Seg::seglist(entry));
            }
            Some("text") => {
                let Some(text) = data.get("text").and_then(|t| t.as_str()) else {
                    continue;
                };
                seg_list.push(Seg::seglist(vec![
                    Seg::text(format!("{indent}{label}")),
                    Seg::text(text),
                    Seg::text("\n"),
                ]));
            }
            Some("image") => {
                image_count += 1;
                let url = data.get("url").and_then(|u| u.as_str()).unwrap_or_default();
                let leaf = if data.get("sub_type").and_then(|s| s.as_i64()) == Some(0) {
                    Seg::Image(url.to_string())
                } else {
                    Seg::Emoji(url.to_string())
                };
                seg_list.push(Seg::seglist(vec![
                    Seg::text(format!("{indent}{label}")),
                    leaf,
                    Seg::text("\n"),
                ]));
            }
            other => trace!(?other, "forward entry type not rendered"),
        }
    }

    seg_list.push(Seg::text(format!("{indent}【转发消息结束】")));
    (Some(Seg::seglist(seg_list)), image_count)
}

/// Walk the tree and either fetch every image/emoji URL to base64
/// (`to_base64`) or replace it with its text placeholder.
fn resolve_images(
    client: &reqwest::Client,
    seg: Seg,
    to_base64: bool,
) -> BoxFuture<'_, Seg> {
    Box::pin(async move {
        match seg {
            Seg::Seglist(children) => {
                let mut resolved = Vec::with_capacity(children.len());
                for child in children {
                    resolved.push(resolve_images(client, child, to_base64).await);
                }
                Seg::Seglist(resolved)
            }
            Seg::Image(url) if to_base64 => match fetch_base64(client, &url).await {
                Ok(encoded) => Seg::Image(encoded),
                Err(e) => {
                    error!("forward image fetch failed: {e}");
                    Seg::text("[图片]")
                }
            },
            Seg::Image(_) => Seg::text("[图片]"),
            Seg::Emoji(url) if to_base64 => match fetch_base64(client, &url).await {
                Ok(encoded) => Seg::Emoji(encoded),
                Err(e) => {
                    error!("forward sticker fetch failed: {e}");
                    Seg::text("[表情包]")
                }
            },
            Seg::Emoji(_) => Seg::text("[动画表情]"),
            other => other,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn text_entry(nick: &str, text: &str) -> Value {
        json!({
            "sender": {"nickname": nick},
            "message": [{"type": "text", "data": {"text": text}}]
        })
    }

    fn image_entry(nick: &str, url: &str) -> Value {
        json!({
            "sender": {"nickname": nick},
            "message": [{"type": "image", "data": {"url": url, "sub_type": 0}}]
        })
    }

    fn collect_leaves(seg: &Seg, out: &mut Vec<Seg>) {
        match seg {
            Seg::Seglist(children) => {
                for child in children {
                    collect_leaves(child, out);
                }
            }
            other => out.push(other.clone()),
        }
    }

    #[test]
    fn tree_counts_images_and_labels_layers() {
        let messages = vec![
            text_entry("amy", "hello"),
            image_entry("bob", "http://x/1.png"),
            json!({
                "sender": {"nickname": "eve"},
                "message": [{"type": "forward", "data": {"content": [
                    image_entry("dan", "http://x/2.png"),
                ]}}]
            }),
        ];
        let (tree, count) = build_tree(&messages, 0);
        assert_eq!(count, 2);
        let mut leaves = Vec::new();
        collect_leaves(&tree.unwrap(), &mut leaves);
        let texts: Vec<String> = leaves
            .iter()
            .filter_map(|s| match s {
                Seg::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        assert!(texts.iter().any(|t| t.contains("【amy】:")));
        // Nested layer is prefixed with the layer indent.
        assert!(texts.iter().any(|t| t.starts_with("--【dan】:")
            || t.contains("--\n【转发消息】")));
    }

    #[test]
    fn depth_cap_yields_placeholder() {
        let (tree, count) = build_tree(&[text_entry("a", "b")], FORWARD_MAX_DEPTH);
        assert_eq!(count, 0);
        assert_eq!(tree.unwrap(), Seg::text("[嵌套过深]"));
    }

    #[tokio::test]
    async fn below_threshold_resolves_to_base64() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"img".to_vec()))
            .mount(&server)
            .await;

        let messages = vec![
            image_entry("a", &format!("{}/1.png", server.uri())),
            image_entry("b", &format!("{}/2.png", server.uri())),
        ];
        let client = reqwest::Client::new();
        let seg = handle_forward(&client, 3, &messages).await.unwrap();
        let mut leaves = Vec::new();
        collect_leaves(&seg, &mut leaves);
        let images: Vec<_> = leaves
            .iter()
            .filter(|s| matches!(s, Seg::Image(_)))
            .collect();
        assert_eq!(images.len(), 2);
        assert!(matches!(images[0], Seg::Image(data) if data == "aW1n"));
    }

    #[tokio::test]
    async fn at_threshold_collapses_to_placeholders() {
        let messages = vec![
            image_entry("a", "http://unreachable.invalid/1.png"),
            image_entry("b", "http://unreachable.invalid/2.png"),
        ];
        let client = reqwest::Client::new();
        let seg = handle_forward(&client, 2, &messages).await.unwrap();
        let mut leaves = Vec::new();
        collect_leaves(&seg, &mut leaves);
        assert!(!leaves.iter().any(|s| matches!(s, Seg::Image(_))));
        let placeholders = leaves
            .iter()
            .filter(|s| matches!(s, Seg::Text(t) if t == "[图片]"))
            .count();
        assert_eq!(placeholders, 2);
    }

    #[tokio::test]
    async fn no_images_passes_through() {
        let client = reqwest::Client::new();
        let seg = handle_forward(&client, 3, &[text_entry("a", "hi")])
            .await
            .unwrap();
        let mut leaves = Vec::new();
        collect_leaves(&seg, &mut leaves);
        assert!(leaves.iter().any(|s| matches!(s, Seg::Text(t) if t == "hi")));
        assert!(matches!(&leaves[0], Seg::Text(t) if t == HEADER));
    }
}
