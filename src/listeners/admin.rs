//! ADMIN_PORT: one command in, response lines plus `END` out (§4.8).

use crate::admin::AdminInterpreter;
use crate::shutdown::Shutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AdminListener {
    interpreter: Arc<AdminInterpreter>,
}

impl AdminListener {
    pub fn new(interpreter: Arc<AdminInterpreter>) -> Self {
        Self { interpreter }
    }

    pub async fn serve(self, listener: TcpListener, shutdown: Shutdown) {
        let interpreter = self.interpreter;
        super::run_accept_loop(listener, shutdown, move |stream, addr| {
            let interpreter = interpreter.clone();
            async move {
                handle_connection(stream, addr, interpreter).await;
            }
        })
        .await;
    }
}

async fn handle_connection(stream: TcpStream, _addr: SocketAddr, interpreter: Arc<AdminInterpreter>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let read_result = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await;
    let Ok(Ok(n)) = read_result else {
        return;
    };
    if n == 0 {
        return;
    }

    let lines = interpreter.execute(&line).await;
    for response in lines {
        if write_half.write_all(format!("{response}\n").as_bytes()).await.is_err() {
            return;
        }
    }
    let _ = write_half.write_all(b"END\n").await;
}
