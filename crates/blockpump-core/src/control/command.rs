//! Control line parsing and replies

/// One parsed control line
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    /// `set <objectId> <value>`
    Set { object_id: i64, value: f32 },
    /// `set` with a payload that does not parse
    MalformedSet,
    /// `exit`: close the session without a reply
    Exit,
    /// Anything else, including empty lines
    Unknown,
}

/// Reply sent for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    InvalidValue,
    InvalidObject,
    InvalidFormat,
    UnknownCommand,
    /// Validation passed but the engine refused the parameter
    EngineError,
}

impl Reply {
    /// Wire text, newline included
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Ok => "OK\n",
            Reply::InvalidValue => "Invalid value\n",
            Reply::InvalidObject => "Invalid object\n",
            Reply::InvalidFormat => "Invalid format\n",
            Reply::UnknownCommand => "Unknown command\n",
            Reply::EngineError => "Engine error\n",
        }
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str().trim_end())
    }
}

/// Parse one line with its terminator already stripped or not
pub fn parse_line(line: &str) -> ControlCommand {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut tokens = line.split_whitespace();

    match tokens.next() {
        Some("exit") => ControlCommand::Exit,
        Some("set") => {
            let args: Vec<&str> = tokens.collect();
            let [id, value] = args.as_slice() else {
                return ControlCommand::MalformedSet;
            };
            match (id.parse::<i64>(), value.parse::<f32>()) {
                (Ok(object_id), Ok(value)) => ControlCommand::Set { object_id, value },
                _ => ControlCommand::MalformedSet,
            }
        }
        _ => ControlCommand::Unknown,
    }
}
