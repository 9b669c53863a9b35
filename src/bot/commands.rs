/// Bot commands understood in private chats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Show,
    SetKeywords,
    FetchNow,
    Cancel,
    Prefs(String),
    Schedule(String),
}

/// Parses `/name[@bot] args`. Returns `None` for plain text, unknown commands
/// and commands addressed to another bot.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<Command> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };

    let name = match head.split_once('@') {
        Some((name, target)) => {
            if let Some(me) = bot_username {
                if !target.eq_ignore_ascii_case(me) {
                    return None;
                }
            }
            name
        }
        None => head,
    };

    let command = match name.to_ascii_lowercase().as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "show" => Command::Show,
        "set_keywords" => Command::SetKeywords,
        "fetch_now" => Command::FetchNow,
        "cancel" => Command::Cancel,
        "prefs" => Command::Prefs(args.to_string()),
        "schedule" => Command::Schedule(args.to_string()),
        _ => return None,
    };
    Some(command)
}

/// Which delivery preference `/prefs` toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefField {
    Tags,
    Translation,
    Summary,
}

impl PrefField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefField::Tags => "tags",
            PrefField::Translation => "translation",
            PrefField::Summary => "summary",
        }
    }
}

/// `tags|translation|summary on|off`
pub fn parse_prefs_args(args: &str) -> Option<(PrefField, bool)> {
    let mut parts = args.split_whitespace();
    let field = match parts.next()?.to_ascii_lowercase().as_str() {
        "tags" => PrefField::Tags,
        "translation" => PrefField::Translation,
        "summary" => PrefField::Summary,
        _ => return None,
    };
    let value = match parts.next()?.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => true,
        "off" | "false" | "0" => false,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((field, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_commands() {
        assert_eq!(parse_command("/start", None), Some(Command::Start));
        assert_eq!(parse_command("  /show  ", None), Some(Command::Show));
        assert_eq!(parse_command("/set_keywords", None), Some(Command::SetKeywords));
        assert_eq!(parse_command("/FETCH_NOW", None), Some(Command::FetchNow));
        assert_eq!(parse_command("hello", None), None);
        assert_eq!(parse_command("/unknown", None), None);
    }

    #[test]
    fn bot_suffix_must_match_when_known() {
        assert_eq!(
            parse_command("/show@ArxivBot", Some("arxivbot")),
            Some(Command::Show)
        );
        assert_eq!(parse_command("/show@OtherBot", Some("arxivbot")), None);
        assert_eq!(parse_command("/show@Anything", None), Some(Command::Show));
    }

    #[test]
    fn arguments_are_kept() {
        assert_eq!(
            parse_command("/schedule daily 08:30", None),
            Some(Command::Schedule("daily 08:30".to_string()))
        );
        assert_eq!(
            parse_command("/prefs@bot tags off", Some("bot")),
            Some(Command::Prefs("tags off".to_string()))
        );
        assert_eq!(parse_command("/prefs", None), Some(Command::Prefs(String::new())));
    }

    #[test]
    fn prefs_arguments() {
        assert_eq!(parse_prefs_args("tags off"), Some((PrefField::Tags, false)));
        assert_eq!(
            parse_prefs_args("Translation ON"),
            Some((PrefField::Translation, true))
        );
        assert_eq!(parse_prefs_args("summary"), None);
        assert_eq!(parse_prefs_args("colour on"), None);
        assert_eq!(parse_prefs_args("tags on now"), None);
    }
}
