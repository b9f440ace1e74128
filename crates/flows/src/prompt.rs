//! Prompt descriptions and the renderer seam.
//!
//! A [`PromptSpec`] is what a step asks to show. A [`PromptRenderer`] turns it
//! into concrete text, an optional image, and buttons whose payloads are
//! still in-memory values; the engine swaps those payloads for tokens before
//! anything reaches the transport.

use async_trait::async_trait;

use crate::{data::FlowData, payload::CallbackPayload};

/// One inline button as declared by a step.
#[derive(Debug, Clone)]
pub struct ButtonSpec {
    pub label: String,
    pub payload: CallbackPayload,
}

impl ButtonSpec {
    pub fn new(label: impl Into<String>, payload: impl Into<CallbackPayload>) -> Self {
        Self {
            label: label.into(),
            payload: payload.into(),
        }
    }
}

/// What a step wants shown to the user.
#[derive(Debug, Clone, Default)]
pub struct PromptSpec {
    /// Message text. May contain `{{key}}` placeholders for [`TemplateRenderer`].
    pub text: String,
    /// Image URL or file id understood by the transport.
    pub image: Option<String>,
    /// Inline keyboard rows.
    pub keyboard: Vec<Vec<ButtonSpec>>,
}

impl PromptSpec {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Append a row of buttons.
    #[must_use]
    pub fn with_row(mut self, row: Vec<ButtonSpec>) -> Self {
        if !row.is_empty() {
            self.keyboard.push(row);
        }
        self
    }

    /// Append a single-button row.
    #[must_use]
    pub fn with_button(self, label: impl Into<String>, payload: impl Into<CallbackPayload>) -> Self {
        self.with_row(vec![ButtonSpec::new(label, payload)])
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.image.is_none() && self.keyboard.is_empty()
    }

    /// Combine a step prompt with an override returned by step logic.
    ///
    /// The override text goes above the step text, separated by a blank line.
    /// An override image or keyboard replaces the step's own.
    #[must_use]
    pub fn merged_with(&self, over: &PromptSpec) -> PromptSpec {
        let text = match (over.text.trim().is_empty(), self.text.trim().is_empty()) {
            (true, _) => self.text.clone(),
            (false, true) => over.text.clone(),
            (false, false) => format!("{}\n\n{}", over.text, self.text),
        };
        PromptSpec {
            text,
            image: over.image.clone().or_else(|| self.image.clone()),
            keyboard: if over.keyboard.is_empty() {
                self.keyboard.clone()
            } else {
                over.keyboard.clone()
            },
        }
    }
}

/// A button after rendering, still carrying its in-memory payload.
#[derive(Debug, Clone)]
pub struct RenderedButton {
    pub label: String,
    pub payload: CallbackPayload,
}

/// Output of a [`PromptRenderer`].
#[derive(Debug, Clone, Default)]
pub struct RenderedPrompt {
    pub text: String,
    pub image: Option<String>,
    pub keyboard: Vec<Vec<RenderedButton>>,
}

impl RenderedPrompt {
    pub fn button_count(&self) -> usize {
        self.keyboard.iter().map(Vec::len).sum()
    }
}

/// Turns a prompt description plus the user's data bag into a message.
#[async_trait]
pub trait PromptRenderer: Send + Sync {
    async fn render(&self, prompt: &PromptSpec, data: &FlowData) -> anyhow::Result<RenderedPrompt>;
}

/// Default renderer: substitutes `{{key}}` placeholders in text and button
/// labels with values from the data bag. Strings are inserted verbatim, other
/// JSON values in their compact form, and unknown keys are left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn substitute(template: &str, data: &FlowData) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let key = rest[start + 2..start + 2 + len].trim();
            out.push_str(&rest[..start]);
            match data.value(key) {
                Some(serde_json::Value::String(s)) => out.push_str(s),
                Some(other) => out.push_str(&other.to_string()),
                None => out.push_str(&rest[start..start + 4 + len]),
            }
            rest = &rest[start + 4 + len..];
        }
        out.push_str(rest);
        out
    }
}

#[async_trait]
impl PromptRenderer for TemplateRenderer {
    async fn render(&self, prompt: &PromptSpec, data: &FlowData) -> anyhow::Result<RenderedPrompt> {
        Ok(RenderedPrompt {
            text: Self::substitute(&prompt.text, data),
            image: prompt.image.clone(),
            keyboard: prompt
                .keyboard
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|button| RenderedButton {
                            label: Self::substitute(&button.label, data),
                            payload: button.payload.clone(),
                        })
                        .collect()
                })
                .collect(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {rstest::rstest, serde_json::json};

    use super::*;

    fn data() -> FlowData {
        [("name", json!("Alice")), ("age", json!(30))]
            .into_iter()
            .collect()
    }

    #[rstest]
    #[case("Hello {{name}}!", "Hello Alice!")]
    #[case("{{ name }} is {{age}}", "Alice is 30")]
    #[case("Hi {{missing}}", "Hi {{missing}}")]
    #[case("unterminated {{name", "unterminated {{name")]
    #[case("no placeholders", "no placeholders")]
    fn substitute_placeholders(#[case] template: &str, #[case] expected: &str) {
        assert_eq!(TemplateRenderer::substitute(template, &data()), expected);
    }

    #[test]
    fn merge_puts_override_text_first() {
        let base = PromptSpec::text("How old are you?").with_button("skip", "skip");
        let merged = base.merged_with(&PromptSpec::text("Nice to meet you."));
        assert_eq!(merged.text, "Nice to meet you.\n\nHow old are you?");
        assert_eq!(merged.keyboard.len(), 1);
    }

    #[test]
    fn merge_override_keyboard_and_image_win() {
        let base = PromptSpec::text("Pick one")
            .with_image("base.png")
            .with_button("a", "a");
        let over = PromptSpec::default()
            .with_image("over.png")
            .with_button("b", "b")
            .with_button("c", "c");
        let merged = base.merged_with(&over);
        assert_eq!(merged.text, "Pick one");
        assert_eq!(merged.image.as_deref(), Some("over.png"));
        assert_eq!(merged.keyboard.len(), 2);
        assert_eq!(merged.keyboard[0][0].payload.as_str(), Some("b"));
    }

    #[tokio::test]
    async fn template_renderer_keeps_payloads() {
        let prompt = PromptSpec::text("Confirm {{name}}?")
            .with_row(vec![
                ButtonSpec::new("Yes, {{name}}", CallbackPayload::new(true)),
                ButtonSpec::new("No", CallbackPayload::new(false)),
            ]);
        let rendered = TemplateRenderer.render(&prompt, &data()).await.unwrap();
        assert_eq!(rendered.text, "Confirm Alice?");
        assert_eq!(rendered.button_count(), 2);
        assert_eq!(rendered.keyboard[0][0].label, "Yes, Alice");
        assert_eq!(rendered.keyboard[0][1].payload.downcast_ref::<bool>(), Some(&false));
    }
}
