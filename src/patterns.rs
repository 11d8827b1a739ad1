/// Name of the pattern that adds no prompt text.
pub const DEFAULT_PATTERN: &str = "No pattern";

/// A named prompt template surfaced to the client UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern {
    pub name: &'static str,
    pub prompt: &'static str,
}

pub const PATTERNS: &[Pattern] = &[
    Pattern {
        name: DEFAULT_PATTERN,
        prompt: "",
    },
    Pattern {
        name: "Plan Day",
        prompt: "Based on the provided notes, create a detailed plan for my day.",
    },
    Pattern {
        name: "Analyse My Day",
        prompt: "Based on the provided notes, analyze my day and give me feedback.",
    },
    Pattern {
        name: "Summarize Notes",
        prompt: "Summarize the key points from the provided notes in a few sentences.",
    },
    Pattern {
        name: "Identify People",
        prompt: "List all the people mentioned in the provided notes.",
    },
    Pattern {
        name: "Extract Actions",
        prompt: "Extract all action items or tasks from the provided notes.",
    },
];

/// Pattern names, default first.
pub fn list_patterns() -> Vec<&'static str> {
    std::iter::once(DEFAULT_PATTERN)
        .chain(
            PATTERNS
                .iter()
                .map(|p| p.name)
                .filter(|name| *name != DEFAULT_PATTERN),
        )
        .collect()
}

/// Template text for a pattern; unknown names have none.
pub fn prompt_for(name: &str) -> &'static str {
    PATTERNS
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.prompt)
        .unwrap_or("")
}

/// Combine the selected pattern's template with the user's message.
pub fn compose_prompt(pattern: Option<&str>, message: &str) -> String {
    let template = pattern.map(prompt_for).unwrap_or("");
    match (template.is_empty(), message.is_empty()) {
        (true, _) => message.to_string(),
        (false, true) => template.to_string(),
        (false, false) => format!("{}\n\n{}", template, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pattern_listed_first() {
        let names = list_patterns();
        assert_eq!(names[0], DEFAULT_PATTERN);
        assert_eq!(names.len(), PATTERNS.len());
        assert_eq!(names[1], "Plan Day");
    }

    #[test]
    fn test_compose_prompt() {
        assert_eq!(compose_prompt(None, "hi"), "hi");
        assert_eq!(compose_prompt(Some(DEFAULT_PATTERN), "hi"), "hi");
        assert_eq!(compose_prompt(Some("Unknown"), "hi"), "hi");
        assert_eq!(
            compose_prompt(Some("Plan Day"), ""),
            "Based on the provided notes, create a detailed plan for my day."
        );
        assert_eq!(
            compose_prompt(Some("Identify People"), "today only"),
            "List all the people mentioned in the provided notes.\n\ntoday only"
        );
    }
}
