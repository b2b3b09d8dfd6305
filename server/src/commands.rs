//! Slash commands typed into chat.

use shared::SpawnOp;

/// Longest display name `/name` accepts.
pub const MAX_NAME_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/admin <code>` toggles admin rank when the code matches.
    Admin(Option<String>),
    /// `/name <display name>`
    Name(String),
    /// `/spawn set` or `/spawn clear`
    Spawn(SpawnOp),
    /// `/chat clear`
    ClearChat,
    Unknown(String),
}

impl Command {
    pub fn parse(words: &[String]) -> Option<Command> {
        let (name, args) = words.split_first()?;
        let command = match (name.as_str(), args) {
            ("admin", [code, ..]) => Command::Admin(Some(code.clone())),
            ("admin", []) => Command::Admin(None),
            ("name", args) => Command::Name(args.join(" ")),
            ("spawn", [op, ..]) if op == "set" => Command::Spawn(SpawnOp::Set),
            ("spawn", [op, ..]) if op == "clear" => Command::Spawn(SpawnOp::Clear),
            ("chat", [op, ..]) if op == "clear" => Command::ClearChat,
            _ => Command::Unknown(words.join(" ")),
        };
        Some(command)
    }
}

/// Trims a requested display name, rejecting empty or overlong ones.
pub fn clean_name(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LENGTH {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> Vec<String> {
        shared::parse_command(line).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse(&words("/admin hunter2")),
            Some(Command::Admin(Some("hunter2".to_string())))
        );
        assert_eq!(Command::parse(&words("/admin")), Some(Command::Admin(None)));
        assert_eq!(
            Command::parse(&words("/name  Captain   Nemo")),
            Some(Command::Name("Captain Nemo".to_string()))
        );
        assert_eq!(
            Command::parse(&words("/spawn set")),
            Some(Command::Spawn(SpawnOp::Set))
        );
        assert_eq!(
            Command::parse(&words("/spawn clear")),
            Some(Command::Spawn(SpawnOp::Clear))
        );
        assert_eq!(Command::parse(&words("/chat clear")), Some(Command::ClearChat));
        assert_eq!(
            Command::parse(&words("/spawn nowhere")),
            Some(Command::Unknown("spawn nowhere".to_string()))
        );
        assert_eq!(Command::parse(&[]), None);
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("  Ada "), Some("Ada".to_string()));
        assert_eq!(clean_name("   "), None);
        assert_eq!(clean_name(&"x".repeat(MAX_NAME_LENGTH + 1)), None);
    }
}
