//! Wire grammar shared by both transports.
//!
//! A request is `METHOD:TOPIC` or `METHOD:TOPIC:PAYLOAD`. The method is
//! case-insensitive; `PUB` takes the three-field form and keeps any further
//! colons in the payload, `SUB` takes the two-field form. Everything else is
//! answered with the usage message.

use crate::utils::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Publish { topic: String, payload: String },
    Subscribe { topic: String },
}

impl ClientMessage {
    /// Parses one request line. A trailing `\n` or `\r\n` is ignored.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = strip_terminator(line);
        let fields: Vec<&str> = line.splitn(3, ':').collect();

        match fields.as_slice() {
            [method, topic] if method.eq_ignore_ascii_case("SUB") && !topic.is_empty() => {
                Ok(Self::Subscribe {
                    topic: topic.to_string(),
                })
            }
            [method, topic, payload]
                if method.eq_ignore_ascii_case("PUB") && !topic.is_empty() =>
            {
                Ok(Self::Publish {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                })
            }
            _ => Err(ProtocolError::Usage),
        }
    }
}

fn strip_terminator(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}
