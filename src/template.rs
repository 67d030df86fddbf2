/// Token replaced by the guest port in command arguments.
pub const GUEST_PORT_TOKEN: &str = "{guest-port}";

/// The user command as typed on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(args: Vec<String>) -> Self {
        Self { args }
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Substitutes every occurrence of the guest port token.
    ///
    /// Arguments without the token are passed through untouched.
    pub fn render(&self, guest_port: u16) -> Vec<String> {
        let port = guest_port.to_string();

        self.args
            .iter()
            .map(|arg| {
                if arg.contains(GUEST_PORT_TOKEN) {
                    arg.replace(GUEST_PORT_TOKEN, &port)
                } else {
                    arg.clone()
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(args: &[&str]) -> CommandTemplate {
        CommandTemplate::new(args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_whole_argument_replaced() {
        let rendered = template(&["sleep", "{guest-port}"]).render(80);
        assert_eq!(rendered, vec!["sleep", "80"]);
    }

    #[test]
    fn test_embedded_and_repeated_tokens() {
        let rendered = template(&[
            "server",
            "--bind=0.0.0.0:{guest-port}",
            "{guest-port}/{guest-port}",
            "--verbose",
        ])
        .render(8888);

        assert_eq!(
            rendered,
            vec!["server", "--bind=0.0.0.0:8888", "8888/8888", "--verbose"]
        );
    }

    #[test]
    fn test_no_token_passthrough() {
        let args = ["python3", "-m", "http.server", "{guest_port}", "{guest-port"];
        let rendered = template(&args).render(1);
        assert_eq!(rendered, args);
    }

    #[test]
    fn test_template_not_mutated() {
        let original = template(&["echo", "{guest-port}"]);
        let _ = original.render(65535);
        assert_eq!(original, template(&["echo", "{guest-port}"]));
    }
}
