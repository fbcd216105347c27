use reading_session::ReadingStep;
use thiserror::Error;

/// One line typed at the session prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Question(String),
    Layout(String),
    Step(ReadingStep),
    Shuffle,
    Draw,
    Interpret(String),
    Zoom(f64),
    Call(CallCommand),
    Show,
    Who,
    SignIn { user_id: String, name: Option<String> },
    Sync,
    End,
    Quit,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    Join,
    Leave,
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unknown command `{0}`, try `help`")]
    Unknown(String),
    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),
    #[error("{0}")]
    Invalid(String),
}

pub const HELP: &str = "\
commands:
  question <text>        set the question
  layout <name>          choose the spread layout
  step <name>            setup | ask-question | drawing | interpretation
  shuffle                shuffle a fresh major arcana deck
  draw                   draw the next card
  interpret <text>       record the interpretation
  zoom <level>           set the shared zoom level
  call start|join|leave  video call membership
  show                   print the session record
  who                    list participants and presence
  signin <user> [name]   attach this participant to an account
  sync                   run a sync cycle now
  end                    end the session (host) or leave it
  quit                   leave and exit";

pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let command = match word.to_ascii_lowercase().as_str() {
        "question" | "q" => Command::Question(required(rest, "question")?),
        "layout" => Command::Layout(required(rest, "layout")?),
        "step" => {
            let name = required(rest, "step")?;
            let step = name
                .parse::<ReadingStep>()
                .map_err(|err| ParseError::Invalid(err.to_string()))?;
            Command::Step(step)
        }
        "shuffle" => Command::Shuffle,
        "draw" => Command::Draw,
        "interpret" => Command::Interpret(required(rest, "interpret")?),
        "zoom" => {
            let raw = required(rest, "zoom")?;
            let level = raw
                .parse::<f64>()
                .ok()
                .filter(|level| level.is_finite() && *level > 0.0)
                .ok_or_else(|| ParseError::Invalid(format!("bad zoom level `{raw}`")))?;
            Command::Zoom(level)
        }
        "call" => match required(rest, "call")?.as_str() {
            "start" | "join" => Command::Call(CallCommand::Join),
            "leave" => Command::Call(CallCommand::Leave),
            other => return Err(ParseError::Invalid(format!("unknown call action `{other}`"))),
        },
        "show" => Command::Show,
        "who" => Command::Who,
        "signin" => {
            let args = required(rest, "signin")?;
            let (user_id, name) = match args.split_once(char::is_whitespace) {
                Some((user, name)) => (user.to_string(), Some(name.trim().to_string())),
                None => (args, None),
            };
            Command::SignIn { user_id, name }
        }
        "sync" => Command::Sync,
        "end" => Command::End,
        "quit" | "exit" => Command::Quit,
        "help" | "?" => Command::Help,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn required(rest: &str, command: &'static str) -> Result<String, ParseError> {
    if rest.is_empty() {
        Err(ParseError::MissingArgument(command))
    } else {
        Ok(rest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_arguments_keep_inner_spaces() {
        assert_eq!(
            parse("question  Will the move go well? ").unwrap(),
            Some(Command::Question("Will the move go well?".into()))
        );
        assert_eq!(
            parse("signin u-1 Ada Lovelace").unwrap(),
            Some(Command::SignIn {
                user_id: "u-1".into(),
                name: Some("Ada Lovelace".into())
            })
        );
    }

    #[test]
    fn steps_and_call_actions() {
        assert_eq!(
            parse("step ask-question").unwrap(),
            Some(Command::Step(ReadingStep::AskQuestion))
        );
        assert_eq!(parse("call start").unwrap(), Some(Command::Call(CallCommand::Join)));
        assert_eq!(parse("CALL leave").unwrap(), Some(Command::Call(CallCommand::Leave)));
        assert!(matches!(parse("step finale"), Err(ParseError::Invalid(_))));
        assert!(matches!(parse("call hangup"), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn bad_input_is_reported() {
        assert_eq!(parse("   ").unwrap(), None);
        assert_eq!(parse("question"), Err(ParseError::MissingArgument("question")));
        assert!(matches!(parse("zoom -2"), Err(ParseError::Invalid(_))));
        assert_eq!(parse("dance"), Err(ParseError::Unknown("dance".into())));
        assert_eq!(parse("zoom 1.5").unwrap(), Some(Command::Zoom(1.5)));
    }
}
