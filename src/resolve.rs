use crate::agent::{endpoints_match, names_match, DeployAgent};

/// The read surface the derived operations need.
pub trait AgentLookup {
    fn load_agents(&self) -> Vec<DeployAgent>;
}

/// Derived operations over any [`AgentLookup`].
pub trait AgentLookupExt: AgentLookup {
    /// Agents whose name is absent from the disabled set.
    fn enabled_agents(&self) -> Vec<DeployAgent> {
        self.load_agents()
            .into_iter()
            .filter(|a| a.is_enabled)
            .collect()
    }

    /// Resolve a name-or-endpoint string against the enabled agents. Names
    /// compare Unicode case-insensitively, endpoints ASCII
    /// case-insensitively. An unmatched input is handed back unchanged: the
    /// caller's literal string is treated as a direct endpoint. Empty input
    /// resolves to nothing.
    fn resolve_endpoint(&self, value: &str) -> Option<String> {
        if value.is_empty() {
            return None;
        }
        let resolved = self
            .enabled_agents()
            .into_iter()
            .find(|a| names_match(&a.name, value) || endpoints_match(&a.endpoint, value))
            .map(|a| a.endpoint);
        Some(resolved.unwrap_or_else(|| value.to_string()))
    }
}

impl<T: AgentLookup + ?Sized> AgentLookupExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<DeployAgent>);

    impl AgentLookup for Fixed {
        fn load_agents(&self) -> Vec<DeployAgent> {
            self.0.clone()
        }
    }

    fn lookup() -> Fixed {
        Fixed(vec![
            DeployAgent::new("Büro", "https://buero.example/feed"),
            DeployAgent::new("staging", "https://staging.example/feed").enabled(false),
            DeployAgent::new("prod", "https://prod.example/feed"),
        ])
    }

    #[test]
    fn enabled_agents_filters_the_overlay() {
        let names: Vec<String> = lookup()
            .enabled_agents()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, ["Büro", "prod"]);
    }

    #[test]
    fn resolves_names_unicode_case_insensitively() {
        assert_eq!(
            lookup().resolve_endpoint("bÜRO").as_deref(),
            Some("https://buero.example/feed")
        );
    }

    #[test]
    fn resolves_endpoints_ascii_case_insensitively_only() {
        assert_eq!(
            lookup().resolve_endpoint("HTTPS://PROD.EXAMPLE/FEED").as_deref(),
            Some("https://prod.example/feed")
        );
        // non-ASCII folding applies to names, never to endpoints
        let fixed = Fixed(vec![DeployAgent::new("x", "https://BÜRO.example/")]);
        assert_eq!(
            fixed.resolve_endpoint("https://büro.example/").as_deref(),
            Some("https://büro.example/")
        );
    }

    #[test]
    fn disabled_agents_do_not_resolve() {
        // the name misses, so the literal input is treated as an endpoint
        assert_eq!(lookup().resolve_endpoint("staging").as_deref(), Some("staging"));
    }

    #[test]
    fn unmatched_input_is_returned_unchanged() {
        assert_eq!(
            lookup().resolve_endpoint("https://elsewhere.example/").as_deref(),
            Some("https://elsewhere.example/")
        );
    }

    #[test]
    fn empty_input_resolves_to_nothing() {
        assert_eq!(lookup().resolve_endpoint(""), None);
    }
}
