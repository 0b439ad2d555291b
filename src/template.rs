use regex::{NoExpand, Regex};

/// Placeholder token recipients' display names are substituted into.
pub const NAME_TOKEN: &str = "{name}";

pub struct MessageRenderer {
    token: Regex,
}

impl Default for MessageRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRenderer {
    pub fn new() -> Self {
        let token = Regex::new(&format!("(?i){}", regex::escape(NAME_TOKEN))).unwrap();
        Self { token }
    }

    /// Replace every occurrence of the name token, regardless of case,
    /// with the recipient's display name. The replacement is literal, so
    /// names containing `$` survive intact.
    pub fn render(&self, template: &str, display_name: &str) -> String {
        self.token
            .replace_all(template, NoExpand(display_name))
            .into_owned()
    }
}
