//! Command dispatch: typed handlers that validate core-issued commands and
//! produce gateway action payloads.

use crate::message::GroupInfo;

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("command {0} must be used in a group context")]
    GroupRequired(String),
    #[error("{0}")]
    Validation(String),
}

type Handler = fn(&Value, Option<&GroupInfo>) -> Result<(String, Value), CommandError>;

pub struct CommandSpec {
    pub require_group: bool,
    handler: Handler,
}

/// Resolve a command name plus args into a gateway `(action, params)` pair.
pub fn build_action(
    name: &str,
    args: &Value,
    group: Option<&GroupInfo>,
) -> Result<(String, Value), CommandError> {
    let spec = REGISTRY
        .get(name)
        .ok_or_else(|| CommandError::Unknown(name.to_string()))?;
    if spec.require_group && group.is_none() {
        return Err(CommandError::GroupRequired(name.to_string()));
    }
    (spec.handler)(args, group)
}

/// Whether `name` is a registered command.
pub fn is_known(name: &str) -> bool {
    REGISTRY.contains_key(name)
}

static REGISTRY: Lazy<HashMap<&'static str, CommandSpec>> = Lazy::new(|| {
    let mut commands: HashMap<&'static str, CommandSpec> = HashMap::new();
    let mut register = |name: &'static str, require_group: bool, handler: Handler| {
        commands.insert(name, CommandSpec {
            require_group,
            handler,
        });
    };

    // Action commands
    register("set_group_ban", true, group_ban);
    register("set_group_whole_ban", true, group_whole_ban);
    register("set_group_kick", true, group_kick);
    register("set_group_kick_members", true, group_kick_members);
    register("send_poke", false, send_poke);
    register("set_group_name", true, group_name);
    register("delete_msg", false, delete_msg);
    register("send_group_ai_record", true, ai_record);
    register("message_like", false, message_like);
    register("set_qq_profile", false, qq_profile);

    // Query commands, forwarded with an echo-correlated response
    register("get_login_info", false, |_, _| {
        Ok(("get_login_info".to_string(), json!({})))
    });
    register("get_stranger_info", false, |args, _| {
        let user_id = require_positive(args, "user_id")?;
        Ok(("get_stranger_info".to_string(), json!({"user_id": user_id})))
    });
    register("get_friend_list", false, |_, _| {
        Ok(("get_friend_list".to_string(), json!({})))
    });
    register("get_group_info", true, |args, group| {
        let group_id = resolve_group_id(args, group)?;
        Ok(("get_group_info".to_string(), json!({"group_id": group_id})))
    });
    register("get_group_detail_info", true, |args, group| {
        let group_id = resolve_group_id(args, group)?;
        Ok((
            "get_group_detail_info".to_string(),
            json!({"group_id": group_id}),
        ))
    });
    register("get_group_list", false, |_, _| {
        Ok(("get_group_list".to_string(), json!({})))
    });
    register("get_group_at_all_remain", true, |args, group| {
        let group_id = resolve_group_id(args, group)?;
        Ok((
            "get_group_at_all_remain".to_string(),
            json!({"group_id": group_id}),
        ))
    });
    register("get_group_member_info", true, |args, group| {
        let group_id = resolve_group_id(args, group)?;
        let user_id = require_positive(args, "user_id")?;
        Ok((
            "get_group_member_info".to_string(),
            json!({"group_id": group_id, "user_id": user_id, "no_cache": true}),
        ))
    });
    register("get_group_member_list", true, |args, group| {
        let group_id = resolve_group_id(args, group)?;
        Ok((
            "get_group_member_list".to_string(),
            json!({"group_id": group_id}),
        ))
    });
    register("get_msg", false, |args, _| {
        let message_id = require_positive(args, "message_id")?;
        Ok(("get_msg".to_string(), json!({"message_id": message_id})))
    });
    register("get_forward_msg", false, |args, _| {
        let message_id = args
            .get("message_id")
            .cloned()
            .ok_or_else(|| CommandError::Validation("missing required arg: message_id".into()))?;
        Ok((
            "get_forward_msg".to_string(),
            json!({"message_id": message_id}),
        ))
    });

    commands
});

// ----------------------------------------------------------------------
// Arg helpers
// ----------------------------------------------------------------------

/// Numbers may arrive as JSON numbers or numeric strings.
fn arg_i64(args: &Value, key: &str) -> Result<i64, CommandError> {
    let value = args
        .get(key)
        .ok_or_else(|| CommandError::Validation(format!("missing required arg: {key}")))?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| CommandError::Validation(format!("arg {key} is not an integer"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| CommandError::Validation(format!("arg {key} is not an integer"))),
        _ => Err(CommandError::Validation(format!(
            "arg {key} is not an integer"
        ))),
    }
}

fn require_positive(args: &Value, key: &str) -> Result<i64, CommandError> {
    let value = arg_i64(args, key)?;
    if value <= 0 {
        return Err(CommandError::Validation(format!("arg {key} must be positive")));
    }
    Ok(value)
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, CommandError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CommandError::Validation(format!("missing required arg: {key}")))
}

fn arg_bool(args: &Value, key: &str) -> Result<bool, CommandError> {
    args.get(key)
        .ok_or_else(|| CommandError::Validation(format!("missing required arg: {key}")))?
        .as_bool()
        .ok_or_else(|| CommandError::Validation(format!("arg {key} must be a boolean")))
}

fn group_id_of(group: Option<&GroupInfo>) -> Result<i64, CommandError> {
    let group_id = group
        .map(|g| g.group_id)
        .ok_or_else(|| CommandError::Validation("group context missing".into()))?;
    if group_id <= 0 {
        return Err(CommandError::Validation("invalid group id".into()));
    }
    Ok(group_id)
}

/// Queries accept an explicit `group_id` arg, falling back to the
/// envelope's group context.
fn resolve_group_id(args: &Value, group: Option<&GroupInfo>) -> Result<i64, CommandError> {
    match args.get("group_id") {
        Some(_) => require_positive(args, "group_id"),
        None => group_id_of(group),
    }
}

// ----------------------------------------------------------------------
// Action command handlers
// ----------------------------------------------------------------------

/// Mute a member for up to 30 days; duration 0 unmutes.
fn group_ban(args: &Value, group: Option<&GroupInfo>) -> Result<(String, Value), CommandError> {
    let duration = arg_i64(args, "duration")?;
    let user_id = require_positive(args, "qq_id")?;
    let group_id = group_id_of(group)?;
    if duration < 0 {
        return Err(CommandError::Validation(
            "ban duration must be zero or more".into(),
        ));
    }
    if duration > 2_592_000 {
        return Err(CommandError::Validation(
            "ban duration cannot exceed 30 days".into(),
        ));
    }
    Ok((
        "set_group_ban".to_string(),
        json!({"group_id": group_id, "user_id": user_id, "duration": duration}),
    ))
}

fn group_whole_ban(
    args: &Value,
    group: Option<&GroupInfo>,
) -> Result<(String, Value), CommandError> {
    let enable = arg_bool(args, "enable")?;
    let group_id = group_id_of(group)?;
    Ok((
        "set_group_whole_ban".to_string(),
        json!({"group_id": group_id, "enable": enable}),
    ))
}

fn group_kick(args: &Value, group: Option<&GroupInfo>) -> Result<(String, Value), CommandError> {
    let user_id = require_positive(args, "user_id")?;
    let group_id = group_id_of(group)?;
    let reject_add_request = args
        .get("reject_add_request")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Ok((
        "set_group_kick".to_string(),
        json!({
            "group_id": group_id,
            "user_id": user_id,
            "reject_add_request": reject_add_request,
        }),
    ))
}

fn group_kick_members(
    args: &Value,
    group: Option<&GroupInfo>,
) -> Result<(String, Value), CommandError> {
    let group_id = group_id_of(group)?;
    let user_ids = args
        .get("user_id")
        .and_then(|v| v.as_array())
        .ok_or_else(|| CommandError::Validation("arg user_id must be an array".into()))?;
    if user_ids.is_empty() {
        return Err(CommandError::Validation(
            "arg user_id needs at least one member".into(),
        ));
    }
    let mut ids = Vec::with_capacity(user_ids.len());
    for entry in user_ids {
        let id = entry
            .as_i64()
            .filter(|id| *id > 0)
            .ok_or_else(|| CommandError::Validation("arg user_id entries must be positive integers".into()))?;
        ids.push(id);
    }
    Ok((
        "set_group_kick_members".to_string(),
        json!({
            "group_id": group_id,
            "user_id": ids,
            "reject_add_request": false,
        }),
    ))
}

fn send_poke(args: &Value, group: Option<&GroupInfo>) -> Result<(String, Value), CommandError> {
    let user_id = require_positive(args, "qq_id")?;
    let group_id = match args.get("group_id") {
        Some(_) => Some(require_positive(args, "group_id")?),
        None => match group {
            Some(group) => {
                if group.group_id <= 0 {
                    return Err(CommandError::Validation("invalid group id".into()));
                }
                Some(group.group_id)
            }
            None => None,
        },
    };
    Ok((
        "send_poke".to_string(),
        json!({"group_id": group_id, "user_id": user_id}),
    ))
}

fn group_name(args: &Value, group: Option<&GroupInfo>) -> Result<(String, Value), CommandError> {
    let name = arg_str(args, "group_name")?;
    if name.trim().is_empty() {
        return Err(CommandError::Validation("group name cannot be empty".into()));
    }
    let group_id = group_id_of(group)?;
    Ok((
        "set_group_name".to_string(),
        json!({"group_id": group_id, "group_name": name}),
    ))
}

fn delete_msg(args: &Value, _group: Option<&GroupInfo>) -> Result<(String, Value), CommandError> {
    let message_id = require_positive(args, "message_id")?;
    Ok(("delete_msg".to_string(), json!({"message_id": message_id})))
}

fn ai_record(args: &Value, group: Option<&GroupInfo>) -> Result<(String, Value), CommandError> {
    let group_id = group_id_of(group)?;
    let character = arg_str(args, "character")?;
    let text = arg_str(args, "text")?;
    if character.is_empty() || text.is_empty() {
        return Err(CommandError::Validation(
            "ai voice needs both a character and text".into(),
        ));
    }
    Ok((
        "send_group_ai_record".to_string(),
        json!({"group_id": group_id, "character": character, "text": text}),
    ))
}

fn message_like(args: &Value, _group: Option<&GroupInfo>) -> Result<(String, Value), CommandError> {
    let message_id = require_positive(args, "message_id")?;
    let emoji_id = require_positive(args, "emoji_id")?;
    Ok((
        "message_like".to_string(),
        json!({"message_id": message_id, "emoji_id": emoji_id, "set": true}),
    ))
}

fn qq_profile(args: &Value, _group: Option<&GroupInfo>) -> Result<(String, Value), CommandError> {
    let nickname = arg_str(args, "nickname")?;
    if nickname.trim().is_empty() {
        return Err(CommandError::Validation("nickname cannot be empty".into()));
    }
    let mut params = json!({"nickname": nickname});
    if let Some(note) = args.get("personal_note").and_then(|v| v.as_str()) {
        params["personal_note"] = json!(note);
    }
    if let Some(sex) = args.get("sex").and_then(|v| v.as_str()) {
        if !matches!(sex, "male" | "female" | "unknown") {
            return Err(CommandError::Validation(
                "sex must be one of male/female/unknown".into(),
            ));
        }
        params["sex"] = json!(sex);
    }
    Ok(("set_qq_profile".to_string(), params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn group() -> GroupInfo {
        GroupInfo {
            platform: "qq".into(),
            group_id: 900,
            group_name: None,
        }
    }

    #[test]
    fn ban_builds_action_payload() {
        let (action, params) = build_action(
            "set_group_ban",
            &json!({"qq_id": 42, "duration": 60}),
            Some(&group()),
        )
        .unwrap();
        assert_eq!(action, "set_group_ban");
        assert_eq!(
            params,
            json!({"group_id": 900, "user_id": 42, "duration": 60})
        );
    }

    #[test]
    fn ban_rejects_excessive_duration() {
        let err = build_action(
            "set_group_ban",
            &json!({"qq_id": 42, "duration": 2_592_001}),
            Some(&group()),
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
    }

    #[test]
    fn group_commands_require_group_context() {
        let err = build_action("set_group_ban", &json!({"qq_id": 1, "duration": 1}), None)
            .unwrap_err();
        assert!(matches!(err, CommandError::GroupRequired(_)));
    }

    #[test]
    fn whole_ban_requires_boolean() {
        let err = build_action(
            "set_group_whole_ban",
            &json!({"enable": "yes"}),
            Some(&group()),
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
        let (_, params) =
            build_action("set_group_whole_ban", &json!({"enable": true}), Some(&group())).unwrap();
        assert_eq!(params["enable"], json!(true));
    }

    #[test]
    fn kick_reads_user_id() {
        let (action, params) =
            build_action("set_group_kick", &json!({"user_id": 42}), Some(&group())).unwrap();
        assert_eq!(action, "set_group_kick");
        assert_eq!(
            params,
            json!({"group_id": 900, "user_id": 42, "reject_add_request": false})
        );

        let err = build_action("set_group_kick", &json!({}), Some(&group())).unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
    }

    #[test]
    fn kick_members_validates_each_entry() {
        let err = build_action(
            "set_group_kick_members",
            &json!({"user_id": []}),
            Some(&group()),
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));

        let err = build_action(
            "set_group_kick_members",
            &json!({"user_id": [5, -1]}),
            Some(&group()),
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));

        let (_, params) = build_action(
            "set_group_kick_members",
            &json!({"user_id": [5, 6]}),
            Some(&group()),
        )
        .unwrap();
        assert_eq!(params["user_id"], json!([5, 6]));
    }

    #[test]
    fn poke_works_without_group() {
        let (_, params) = build_action("send_poke", &json!({"qq_id": 3}), None).unwrap();
        assert_eq!(params, json!({"group_id": null, "user_id": 3}));
    }

    #[test]
    fn delete_msg_rejects_nonpositive_id() {
        let err = build_action("delete_msg", &json!({"message_id": 0}), None).unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
    }

    #[test]
    fn profile_validates_sex_values() {
        let err = build_action(
            "set_qq_profile",
            &json!({"nickname": "mai", "sex": "robot"}),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));

        let (_, params) = build_action(
            "set_qq_profile",
            &json!({"nickname": "mai", "sex": "female", "personal_note": "hi"}),
            None,
        )
        .unwrap();
        assert_eq!(params["sex"], json!("female"));
        assert_eq!(params["personal_note"], json!("hi"));
    }

    #[test]
    fn query_inherits_group_from_context() {
        let (action, params) = build_action("get_group_info", &json!({}), Some(&group())).unwrap();
        assert_eq!(action, "get_group_info");
        assert_eq!(params["group_id"], json!(900));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = build_action("warp_drive", &json!({}), None).unwrap_err();
        assert!(matches!(err, CommandError::Unknown(_)));
    }
}
