use camino::Utf8PathBuf;

/// Prefix that marks a line as a manager command rather than server input
pub const COMMAND_PREFIX: char = '!';

/// One line typed at the manager console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Force,
    Kill,
    Backup,
    List,
    Restore(Utf8PathBuf),
    SetBackups(bool),
    Status,
    Help,
    Quit,
    /// Anything without the command prefix goes to the server's stdin
    Forward(String),
    /// A `!`-line we could not understand, with the reason
    Invalid(String),
}

impl ConsoleCommand {
    /// Interpret one console line
    ///
    /// Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        let Some(rest) = line.trim_start().strip_prefix(COMMAND_PREFIX) else {
            return Some(Self::Forward(line.to_string()));
        };

        let mut parts = rest.trim().splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default().to_ascii_lowercase();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

        let command = match (name.as_str(), arg) {
            ("start", None) => Self::Start,
            ("stop", None) => Self::Stop,
            ("force", None) => Self::Force,
            ("kill", None) => Self::Kill,
            ("backup", None) => Self::Backup,
            ("list", None) => Self::List,
            ("status", None) => Self::Status,
            ("help", None) => Self::Help,
            ("quit" | "exit", None) => Self::Quit,
            ("restore", Some(path)) => Self::Restore(Utf8PathBuf::from(unquote(path))),
            ("restore", None) => Self::Invalid("usage: !restore <archive path>".to_string()),
            ("backups", Some(flag)) => match flag.to_ascii_lowercase().as_str() {
                "on" | "true" | "enable" => Self::SetBackups(true),
                "off" | "false" | "disable" => Self::SetBackups(false),
                _ => Self::Invalid("usage: !backups on|off".to_string()),
            },
            ("backups", None) => Self::Invalid("usage: !backups on|off".to_string()),
            (other, Some(_)) if is_known(other) => {
                Self::Invalid(format!("!{} takes no arguments", other))
            }
            (other, _) => Self::Invalid(format!("Unknown command: !{}", other)),
        };

        Some(command)
    }
}

fn is_known(name: &str) -> bool {
    matches!(
        name,
        "start" | "stop" | "force" | "kill" | "backup" | "list" | "status" | "help" | "quit" | "exit"
    )
}

fn unquote(arg: &str) -> &str {
    arg.strip_prefix('"')
        .and_then(|a| a.strip_suffix('"'))
        .unwrap_or(arg)
}

/// Text shown for `!help`
pub const HELP_TEXT: &str = "\
Manager commands:
  !start            launch the server
  !stop             graceful stop (escalates after the timeout)
  !force            send the terminate signal
  !kill             kill the server immediately
  !backup           create a backup now
  !list             list backups, newest first
  !restore <path>   restore a backup into the Saves folder
  !backups on|off   toggle scheduled backups
  !status           show server and backup status
  !quit             stop everything and exit
Any other line is sent to the server console.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_lines_ignored() {
        assert_eq!(ConsoleCommand::parse(""), None);
        assert_eq!(ConsoleCommand::parse("   \r\n"), None);
    }

    #[test]
    fn test_forwarded_lines_keep_their_text() {
        assert_eq!(
            ConsoleCommand::parse("/time set day\n"),
            Some(ConsoleCommand::Forward("/time set day".to_string()))
        );
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(ConsoleCommand::parse("!start"), Some(ConsoleCommand::Start));
        assert_eq!(ConsoleCommand::parse("  !STOP "), Some(ConsoleCommand::Stop));
        assert_eq!(ConsoleCommand::parse("!exit"), Some(ConsoleCommand::Quit));
        assert_eq!(ConsoleCommand::parse("!list"), Some(ConsoleCommand::List));
    }

    #[test]
    fn test_restore_path_with_spaces() {
        assert_eq!(
            ConsoleCommand::parse("!restore \"/srv/vs backups/Manual_2024.zip\""),
            Some(ConsoleCommand::Restore(Utf8PathBuf::from(
                "/srv/vs backups/Manual_2024.zip"
            )))
        );
        assert_eq!(
            ConsoleCommand::parse("!restore /b/x.zip"),
            Some(ConsoleCommand::Restore(Utf8PathBuf::from("/b/x.zip")))
        );
        assert!(matches!(
            ConsoleCommand::parse("!restore"),
            Some(ConsoleCommand::Invalid(_))
        ));
    }

    #[test]
    fn test_backups_toggle() {
        assert_eq!(
            ConsoleCommand::parse("!backups on"),
            Some(ConsoleCommand::SetBackups(true))
        );
        assert_eq!(
            ConsoleCommand::parse("!backups OFF"),
            Some(ConsoleCommand::SetBackups(false))
        );
        assert!(matches!(
            ConsoleCommand::parse("!backups maybe"),
            Some(ConsoleCommand::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_and_extra_arguments() {
        assert_eq!(
            ConsoleCommand::parse("!frobnicate"),
            Some(ConsoleCommand::Invalid("Unknown command: !frobnicate".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("!kill now"),
            Some(ConsoleCommand::Invalid("!kill takes no arguments".to_string()))
        );
    }
}
