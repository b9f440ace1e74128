use std::path::Path;

use {
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use crate::{
    definition::ButtonClickPolicy,
    error::{Context, Error, Result},
};

/// What `start_flow` does when the user is already in a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartConflictPolicy {
    /// Fail with [`Error::AlreadyInFlow`].
    #[default]
    Reject,
    /// Cancel the active flow (callback and token cleanup included), then start.
    Restart,
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowEngineConfig {
    /// Commands that cancel the active flow from any step.
    pub exit_commands: Vec<String>,

    /// Commands that bypass step routing entirely.
    pub global_commands: Vec<String>,

    /// Sent after an exit command cancels a flow. Empty disables it.
    pub exit_message: String,

    /// Notice shown when a stale button is pressed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_button_text: Option<String>,

    pub start_conflict: StartConflictPolicy,

    /// Applied to flows built without an explicit button policy.
    pub default_button_policy: ButtonClickPolicy,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self {
            exit_commands: vec!["/cancel".into()],
            global_commands: vec!["/help".into()],
            exit_message: "Cancelled.".into(),
            stale_button_text: None,
            start_conflict: StartConflictPolicy::default(),
            default_button_policy: ButtonClickPolicy::default(),
        }
    }
}

impl FlowEngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Load from a `.toml` or `.json` file. Files without an extension are
    /// read as TOML. Parse errors name the file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        let config = match ext {
            "toml" => Self::from_toml_str(&raw),
            "json" => Self::from_json_str(&raw),
            _ => return Err(Error::config(format!("unsupported config format: .{ext}"))),
        }
        .with_context(|| format!("parsing {}", path.display()))?;
        debug!(path = %path.display(), "loaded flow engine config");
        Ok(config)
    }

    pub fn is_exit_command(&self, text: &str) -> bool {
        matches_command(&self.exit_commands, text)
    }

    pub fn is_global_command(&self, text: &str) -> bool {
        matches_command(&self.global_commands, text)
    }
}

/// The slash command a message starts with, without any `@botname` suffix:
/// `/start@my_bot now` gives `/start`.
pub fn command_word(text: &str) -> Option<&str> {
    let word = text.split_whitespace().next()?;
    if !word.starts_with('/') {
        return None;
    }
    Some(word.split_once('@').map_or(word, |(command, _bot)| command))
}

/// `/Cancel@my_bot now` matches `/cancel`.
fn matches_command(commands: &[String], text: &str) -> bool {
    command_word(text).is_some_and(|word| {
        commands
            .iter()
            .any(|command| command.trim().eq_ignore_ascii_case(word))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {rstest::rstest, std::io::Write};

    use super::*;

    #[rstest]
    #[case("/cancel", true)]
    #[case("  /CANCEL  ", true)]
    #[case("/cancel now please", true)]
    #[case("/cancel@parley_bot", true)]
    #[case("/cancelled", false)]
    #[case("cancel", false)]
    #[case("", false)]
    #[case("/help", false)]
    fn exit_command_matching(#[case] text: &str, #[case] expected: bool) {
        assert_eq!(FlowEngineConfig::default().is_exit_command(text), expected);
    }

    #[rstest]
    #[case("/start", Some("/start"))]
    #[case("/start@parley_bot ref42", Some("/start"))]
    #[case("  /Help@parley_bot", Some("/Help"))]
    #[case("start", None)]
    #[case("", None)]
    fn command_word_strips_bot_name(#[case] text: &str, #[case] expected: Option<&str>) {
        assert_eq!(command_word(text), expected);
    }

    #[test]
    fn global_commands_are_separate() {
        let config = FlowEngineConfig::default();
        assert!(config.is_global_command("/help"));
        assert!(!config.is_global_command("/cancel"));
    }

    #[test]
    fn toml_overrides_keep_other_defaults() {
        let config = FlowEngineConfig::from_toml_str(
            r#"
            exit_commands = ["/stop", "/quit"]
            start_conflict = "restart"
            default_button_policy = "delete_keyboard"
            "#,
        )
        .unwrap();
        assert!(config.is_exit_command("/quit"));
        assert!(!config.is_exit_command("/cancel"));
        assert_eq!(config.start_conflict, StartConflictPolicy::Restart);
        assert_eq!(config.default_button_policy, ButtonClickPolicy::DeleteKeyboard);
        assert_eq!(config.exit_message, "Cancelled.");
        assert_eq!(config.global_commands, vec!["/help".to_string()]);
    }

    #[test]
    fn json_config() {
        let config =
            FlowEngineConfig::from_json_str(r#"{"stale_button_text":"This button expired"}"#)
                .unwrap();
        assert_eq!(config.stale_button_text.as_deref(), Some("This button expired"));
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let err = FlowEngineConfig::from_toml_str(r#"start_conflict = "maybe""#).unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("flows.toml");
        std::fs::write(&toml_path, "exit_message = \"Bye\"\n").unwrap();
        assert_eq!(FlowEngineConfig::load(&toml_path).unwrap().exit_message, "Bye");

        let json_path = dir.path().join("flows.json");
        let mut file = std::fs::File::create(&json_path).unwrap();
        file.write_all(br#"{"exit_message":""}"#).unwrap();
        assert_eq!(FlowEngineConfig::load(&json_path).unwrap().exit_message, "");

        let yaml_path = dir.path().join("flows.yaml");
        std::fs::write(&yaml_path, "exit_message: x\n").unwrap();
        assert!(matches!(
            FlowEngineConfig::load(&yaml_path).unwrap_err(),
            Error::Config { .. }
        ));

        assert!(matches!(
            FlowEngineConfig::load(&dir.path().join("missing.toml")).unwrap_err(),
            Error::Io(_)
        ));

        let broken_path = dir.path().join("broken.toml");
        std::fs::write(&broken_path, "start_conflict = \"maybe\"\n").unwrap();
        let err = FlowEngineConfig::load(&broken_path).unwrap_err();
        assert!(matches!(err, Error::Message { .. }));
        assert!(err.to_string().starts_with("parsing "), "{err}");
        assert!(err.to_string().contains("broken.toml"), "{err}");
    }
}
