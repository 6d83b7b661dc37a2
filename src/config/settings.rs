use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Covers both network front ends, the broker core and the log sink.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub stream: StreamSettings,
    pub datagram: DatagramSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Bind address and request limit of the stream (TCP) transport.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StreamSettings {
    pub host: String,
    pub port: u16,
    /// Longest request line accepted, terminator included, in bytes. A
    /// longer line closes the connection.
    pub max_line_len: usize,
}

/// Bind address and receive buffer of the datagram (UDP) transport.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DatagramSettings {
    pub host: String,
    pub port: u16,
    /// Largest request accepted in a single datagram, in bytes.
    pub max_datagram_size: usize,
}

/// Queue sizes of the broker core.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    /// Pending requests buffered ahead of the processor.
    pub request_queue_capacity: usize,
    /// Deliveries buffered per subscription before it is disconnected.
    pub subscriber_buffer: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    pub queue_capacity: usize,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled in from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub stream: Option<PartialStreamSettings>,
    pub datagram: Option<PartialDatagramSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStreamSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_line_len: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDatagramSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_datagram_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub request_queue_capacity: Option<usize>,
    pub subscriber_buffer: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
    pub queue_capacity: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stream: StreamSettings {
                host: "127.0.0.1".to_string(),
                port: 8000,
                max_line_len: 64 * 1024,
            },
            datagram: DatagramSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_datagram_size: 1024,
            },
            broker: BrokerSettings {
                request_queue_capacity: 100,
                subscriber_buffer: 64,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                queue_capacity: 100,
            },
        }
    }
}

impl PartialSettings {
    /// Overlays the values that are present onto `base`.
    pub fn merge_into(self, base: Settings) -> Settings {
        let stream = self.stream.unwrap_or_default();
        let datagram = self.datagram.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            stream: StreamSettings {
                host: stream.host.unwrap_or(base.stream.host),
                port: stream.port.unwrap_or(base.stream.port),
                max_line_len: stream.max_line_len.unwrap_or(base.stream.max_line_len),
            },
            datagram: DatagramSettings {
                host: datagram.host.unwrap_or(base.datagram.host),
                port: datagram.port.unwrap_or(base.datagram.port),
                max_datagram_size: datagram
                    .max_datagram_size
                    .unwrap_or(base.datagram.max_datagram_size),
            },
            broker: BrokerSettings {
                request_queue_capacity: broker
                    .request_queue_capacity
                    .unwrap_or(base.broker.request_queue_capacity),
                subscriber_buffer: broker
                    .subscriber_buffer
                    .unwrap_or(base.broker.subscriber_buffer),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(base.logging.level),
                queue_capacity: logging
                    .queue_capacity
                    .unwrap_or(base.logging.queue_capacity),
            },
        }
    }
}
