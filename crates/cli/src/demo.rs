//! Bundled `signup` flow, started with `/start`.

use parley_flows::{
    ButtonClickPolicy, ButtonSpec, ErrorPolicy, FlowDefinition, PromptSpec, Result, StepBuilder,
    StepResult,
};

pub const SIGNUP_FLOW: &str = "signup";

const MAX_NAME_LEN: usize = 64;

pub fn signup_flow() -> Result<FlowDefinition> {
    FlowDefinition::builder(SIGNUP_FLOW)
        .step(
            StepBuilder::new("name")
                .prompt(PromptSpec::text("Hi! What's your name?"))
                .validator(|text| {
                    let name = text.trim();
                    if name.is_empty() || name.starts_with('/') {
                        Err("Please type your name.".to_string())
                    } else if name.chars().count() > MAX_NAME_LEN {
                        Err(format!("Please keep it under {MAX_NAME_LEN} characters."))
                    } else {
                        Ok(())
                    }
                })
                .process(|ctx, input| {
                    let name = input.text().unwrap_or_default().trim().to_string();
                    ctx.data.insert("name", name);
                    Ok(StepResult::next())
                }),
        )
        .step(
            StepBuilder::new("age")
                .prompt(PromptSpec::text("How old are you, {{name}}?"))
                .validator(|text| match text.trim().parse::<u8>() {
                    Ok(age) if (1..=120).contains(&age) => Ok(()),
                    _ => Err("Please send your age as a number.".to_string()),
                })
                .process(|ctx, input| {
                    let age: u8 = input.text().unwrap_or_default().trim().parse()?;
                    ctx.data.insert("age", age);
                    Ok(StepResult::next())
                }),
        )
        .step(
            StepBuilder::new("confirm")
                .prompt(
                    PromptSpec::text("{{name}}, {{age}}. Is that right?").with_row(vec![
                        ButtonSpec::new("Yes", "yes"),
                        ButtonSpec::new("Start over", "again"),
                        ButtonSpec::new("Cancel", "cancel"),
                    ]),
                )
                .process(|_, input| {
                    let choice = input.payload().and_then(|p| p.as_str());
                    Ok(match choice {
                        Some("yes") => StepResult::complete().with_text("Thanks, {{name}}. You're signed up."),
                        Some("again") => StepResult::go_to("name"),
                        Some("cancel") => StepResult::cancel().with_text("No problem, nothing was saved."),
                        _ => StepResult::retry().with_text("Please use the buttons below."),
                    })
                }),
        )
        .error_policy(ErrorPolicy::Retry {
            message: Some("That didn't work, please try again.".to_string()),
        })
        .button_policy(ButtonClickPolicy::DeleteKeyboard)
        .build()
}
