//! Slash commands for interactive mode

/// A parsed slash command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    /// Start a fresh conversation
    New,
    /// List conversations
    List,
    /// Switch to a conversation by id (or unique id prefix)
    Open(String),
    Delete(String),
    /// Rename the active conversation
    Rename(String),
    /// Reconnect the live stream or re-run a failed turn
    Retry,
    Quit,
    /// Known command missing its argument
    Usage(&'static str),
    Unknown(String),
}

/// Parse a line of input; `None` if it is not a slash command
pub fn parse(input: &str) -> Option<Command> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next().unwrap_or("").to_lowercase();
    let args = parts.next().map(str::trim).unwrap_or("");

    let with_arg = |make: fn(String) -> Command, usage: &'static str| {
        if args.is_empty() {
            Command::Usage(usage)
        } else {
            make(args.to_string())
        }
    };

    Some(match command.as_str() {
        "help" | "h" | "?" => Command::Help,
        "new" | "n" => Command::New,
        "list" | "ls" | "l" => Command::List,
        "open" | "o" => with_arg(Command::Open, "/open <id>"),
        "delete" | "rm" => with_arg(Command::Delete, "/delete <id>"),
        "rename" => with_arg(Command::Rename, "/rename <title>"),
        "retry" | "r" => Command::Retry,
        "quit" | "exit" | "q" => Command::Quit,
        _ => Command::Unknown(command),
    })
}

pub fn help_message() -> &'static str {
    r#"Available commands:
  /help, /h, /?        Show this help message
  /new, /n             Start a new conversation
  /list, /ls           List conversations
  /open <id>           Switch to a conversation (id prefix is enough)
  /delete <id>         Delete a conversation
  /rename <title>      Rename the current conversation
  /retry, /r           Reconnect, or retry a turn that failed
  /quit, /q            Exit"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_not_a_command() {
        assert_eq!(parse("hello"), None);
        assert_eq!(parse("  what is /proc?"), None);
    }

    #[test]
    fn test_commands_and_aliases() {
        assert_eq!(parse("/new"), Some(Command::New));
        assert_eq!(parse("/LS"), Some(Command::List));
        assert_eq!(parse(" /q "), Some(Command::Quit));
        assert_eq!(parse("/r"), Some(Command::Retry));
    }

    #[test]
    fn test_arguments_are_trimmed() {
        assert_eq!(
            parse("/rename   Borrow checker notes "),
            Some(Command::Rename("Borrow checker notes".into()))
        );
        assert_eq!(parse("/open abc"), Some(Command::Open("abc".into())));
    }

    #[test]
    fn test_missing_argument_reports_usage() {
        assert_eq!(parse("/open"), Some(Command::Usage("/open <id>")));
        assert_eq!(parse("/delete "), Some(Command::Usage("/delete <id>")));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse("/frobnicate"), Some(Command::Unknown("frobnicate".into())));
    }
}
