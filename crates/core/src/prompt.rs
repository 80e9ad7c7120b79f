//! Prompt/persona provider.
//!
//! The engine never stores prompt text itself. It asks a [`PromptProvider`]
//! for persona-scoped system instructions and for named tool prompts.
//! [`TemplatePrompts`] is an in-memory implementation with `{placeholder}`
//! templates; `{{` and `}}` escape literal braces.

use std::collections::HashMap;

use crate::error::PromptError;

pub trait PromptProvider: Send + Sync {
    /// System instructions for `persona`, with `context` folded in.
    fn system_instructions(&self, persona: &str, context: &str) -> Result<String, PromptError>;

    /// Render the named prompt. Every placeholder in the template must have a
    /// value in `args`, otherwise [`PromptError::MissingPlaceholder`].
    fn tool_prompt(&self, name: &str, args: &HashMap<String, String>)
    -> Result<String, PromptError>;
}

pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful assistant. Answer concisely and accurately, \
     and use the available tools when they help.";

#[derive(Debug, Clone)]
pub struct TemplatePrompts {
    default_instructions: String,
    personas: HashMap<String, String>,
    templates: HashMap<String, String>,
}

impl Default for TemplatePrompts {
    fn default() -> Self {
        Self::new(DEFAULT_INSTRUCTIONS)
    }
}

impl TemplatePrompts {
    pub fn new(default_instructions: impl Into<String>) -> Self {
        Self {
            default_instructions: default_instructions.into(),
            personas: HashMap::new(),
            templates: HashMap::new(),
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>, instructions: impl Into<String>) -> Self {
        self.personas.insert(persona.into(), instructions.into());
        self
    }

    pub fn with_template(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates.insert(name.into(), template.into());
        self
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }
}

impl PromptProvider for TemplatePrompts {
    fn system_instructions(&self, persona: &str, context: &str) -> Result<String, PromptError> {
        let base = self
            .personas
            .get(persona)
            .unwrap_or(&self.default_instructions);
        if context.trim().is_empty() {
            Ok(base.clone())
        } else {
            Ok(format!("{base}\n\n{context}"))
        }
    }

    fn tool_prompt(
        &self,
        name: &str,
        args: &HashMap<String, String>,
    ) -> Result<String, PromptError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| PromptError::UnknownTemplate(name.to_string()))?;
        render(name, template, args)
    }
}

/// Placeholder names in order of first appearance.
#[cfg(test)]
fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
            }
            '{' => {
                let name: String = chars.by_ref().take_while(|&c| c != '}').collect();
                let name = name.trim().to_string();
                if !name.is_empty() && !names.contains(&name) {
                    names.push(name);
                }
            }
            _ => {}
        }
    }
    names
}

fn render(
    template_name: &str,
    template: &str,
    args: &HashMap<String, String>,
) -> Result<String, PromptError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(PromptError::Malformed(template_name.to_string()));
                }
                let key = name.trim();
                let value = args.get(key).ok_or_else(|| PromptError::MissingPlaceholder {
                    template: template_name.to_string(),
                    placeholder: key.to_string(),
                })?;
                out.push_str(value);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_all_placeholders() {
        let prompts = TemplatePrompts::default()
            .with_template("planning", "Round {round}. Tools: {capabilities}. Literal {{x}}.");
        let text = prompts
            .tool_prompt("planning", &args(&[("round", "2"), ("capabilities", "search")]))
            .unwrap();
        assert_eq!(text, "Round 2. Tools: search. Literal {x}.");
    }

    #[test]
    fn missing_placeholder_fails_loudly() {
        let prompts = TemplatePrompts::default().with_template("planning", "Round {round}");
        let err = prompts.tool_prompt("planning", &HashMap::new()).unwrap_err();
        assert_eq!(
            err,
            PromptError::MissingPlaceholder {
                template: "planning".into(),
                placeholder: "round".into(),
            }
        );
    }

    #[test]
    fn unknown_and_malformed_templates() {
        let prompts = TemplatePrompts::default().with_template("broken", "oops {round");
        assert!(matches!(
            prompts.tool_prompt("nope", &HashMap::new()),
            Err(PromptError::UnknownTemplate(_))
        ));
        assert!(matches!(
            prompts.tool_prompt("broken", &args(&[("round", "1")])),
            Err(PromptError::Malformed(_))
        ));
    }

    #[test]
    fn persona_instructions_with_context() {
        let prompts = TemplatePrompts::new("default voice").with_persona("pirate", "Arr.");
        assert_eq!(prompts.system_instructions("pirate", "").unwrap(), "Arr.");
        let scoped = prompts.system_instructions("unknown", "Facts: x").unwrap();
        assert_eq!(scoped, "default voice\n\nFacts: x");
    }

    #[test]
    fn placeholder_listing() {
        assert_eq!(
            placeholders("{a} and {b} and {a} but not {{c}}"),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
