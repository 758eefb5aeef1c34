//! Direct TCP egress with a connect timeout.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::DialError;

pub struct DirectDialer {
    connect_timeout: Duration,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub async fn connect(&self, target: &str) -> Result<TcpStream, DialError> {
        match timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(DialError::Connect {
                addr: target.to_string(),
                source,
            }),
            Err(_) => Err(DialError::Timeout {
                addr: target.to_string(),
            }),
        }
    }
}
