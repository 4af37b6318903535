//! The pluggable piece that turns a request body into response text.
//!
//! The broker treats a [`Responder`] as opaque. Closures with the right
//! signature implement the trait, and [`TemplateResponder`] is the keyword
//! based default used by `spool serve`.

use spool_protocol::SessionId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ResponderError(pub String);

impl ResponderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub trait Responder: Send + Sync {
    fn respond(&self, instruction: &str, session: &SessionId) -> Result<String, ResponderError>;
}

impl<F> Responder for F
where
    F: Fn(&str, &SessionId) -> Result<String, ResponderError> + Send + Sync,
{
    fn respond(&self, instruction: &str, session: &SessionId) -> Result<String, ResponderError> {
        self(instruction, session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    keywords: Vec<String>,
    template: String,
}

/// Picks the first rule whose keyword occurs in the instruction
/// (case-insensitive) and renders its template. `{instruction}` and
/// `{session}` are substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateResponder {
    rules: Vec<Rule>,
    fallback: String,
}

impl Default for TemplateResponder {
    fn default() -> Self {
        Self::new("Processed request {session}: {instruction}")
            .rule(
                ["reconcile", "match"],
                "Reconciliation queued for session {session}. Instruction: {instruction}",
            )
            .rule(
                ["summary", "summarize", "report"],
                "Summary for session {session}: {instruction}",
            )
    }
}

impl TemplateResponder {
    #[must_use]
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            fallback: fallback.into(),
        }
    }

    #[must_use]
    pub fn rule<I, S>(mut self, keywords: I, template: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push(Rule {
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .collect(),
            template: template.into(),
        });
        self
    }

    fn render(template: &str, instruction: &str, session: &SessionId) -> String {
        template
            .replace("{session}", session.as_str())
            .replace("{instruction}", instruction)
    }
}

impl Responder for TemplateResponder {
    fn respond(&self, instruction: &str, session: &SessionId) -> Result<String, ResponderError> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(ResponderError::new("empty instruction"));
        }
        let lowered = instruction.to_lowercase();
        let template = self
            .rules
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| lowered.contains(k.as_str())))
            .map_or(self.fallback.as_str(), |rule| rule.template.as_str());
        Ok(Self::render(template, instruction, session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session() -> SessionId {
        SessionId::parse("abc").unwrap()
    }

    #[test]
    fn template_matches_keywords_case_insensitively() {
        let responder = TemplateResponder::default();
        let out = responder
            .respond("Please RECONCILE march invoices", &session())
            .unwrap();
        assert_eq!(
            out,
            "Reconciliation queued for session abc. Instruction: Please RECONCILE march invoices"
        );
    }

    #[test]
    fn template_falls_back() {
        let responder = TemplateResponder::default();
        assert_eq!(
            responder.respond("R1", &session()).unwrap(),
            "Processed request abc: R1"
        );
        assert!(responder.respond("   ", &session()).is_err());
    }

    #[test]
    fn closures_are_responders() {
        let responder = |text: &str, _: &SessionId| -> Result<String, ResponderError> {
            Ok(text.to_uppercase())
        };
        assert_eq!(responder.respond("hi", &session()).unwrap(), "HI");
    }
}
