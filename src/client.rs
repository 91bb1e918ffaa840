//! Interactive chat client.
//!
//! Connects to a hub, announces its name, then forwards stdin lines as chat
//! messages while printing whatever the hub sends back. Blocking I/O is
//! fine here: one thread reads stdin, the main thread reads the socket.

use std::io::{self, BufRead, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;

use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::protocol::{read_message, write_message, CodecError, Message};

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to chat server at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A client that has completed the handshake.
#[derive(Debug)]
pub struct ChatClient {
    stream: TcpStream,
    name: String,
    /// Our address as the hub sees it.
    address: String,
    max_frame_size: usize,
}

impl ChatClient {
    /// Connect to `addr` and perform the name handshake.
    pub fn connect(addr: SocketAddr, name: &str, max_frame_size: usize) -> Result<Self, ClientError> {
        let mut stream =
            TcpStream::connect(addr).map_err(|source| ClientError::Connect { addr, source })?;
        stream.set_nodelay(true)?;

        write_message(&mut stream, &Message::name_announce(name))?;

        let address = match read_message(&mut stream, max_frame_size)? {
            Some(Message::AddressAck { address }) => address,
            Some(other) => {
                return Err(ClientError::Handshake(format!(
                    "unexpected reply: {}",
                    other.display_line()
                )))
            }
            None => return Err(ClientError::Handshake("server closed the connection".into())),
        };

        debug!(%addr, %address, "Handshake complete");

        Ok(Self {
            stream,
            name: name.to_string(),
            address,
            max_frame_size,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// `[name@address]> `
    pub fn prompt(&self) -> String {
        format!("[{}@{}]> ", self.name, self.address())
    }

    #[cfg(test)]
    pub fn send_line(&mut self, text: &str) -> Result<(), CodecError> {
        write_message(&mut self.stream, &Message::chat_line(text))
    }

    /// Next message from the hub, `None` once it closes the stream.
    pub fn recv(&mut self) -> Result<Option<Message>, CodecError> {
        read_message(&mut self.stream, self.max_frame_size)
    }

    /// Independent handle on the same socket for a writer thread.
    pub fn writer(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }
}

/// Run the interactive client until the hub hangs up.
pub fn run(config: &Config, name: &str) -> Result<(), ClientError> {
    let mut client = ChatClient::connect(config.listen, name, config.max_frame_size)?;
    println!("Now connected to chat server@ port {}", config.listen.port());

    let input_prompt = client.prompt();
    let mut writer = client.writer()?;

    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if !line.is_empty()
                && write_message(&mut writer, &Message::chat_line(line)).is_err()
            {
                break;
            }
            print_prompt(&input_prompt);
        }
        // Stdin closed: let the hub see our end of stream.
        let _ = writer.shutdown(Shutdown::Write);
    });

    relay_to(&mut client, &mut io::stdout())
}

/// Print everything the hub sends until it hangs up.
///
/// A reset connection ends the session like an orderly close does.
fn relay_to<W: Write>(client: &mut ChatClient, out: &mut W) -> Result<(), ClientError> {
    let prompt = client.prompt();
    write_prompt(out, &prompt)?;

    loop {
        match client.recv() {
            Ok(Some(message)) => {
                writeln!(out, "\n{}", message.display_line())?;
                write_prompt(out, &prompt)?;
            }
            Ok(None) => break,
            Err(CodecError::Io(e)) => {
                debug!(error = %e, "Connection to hub lost");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    writeln!(out, "Client shutting down.")?;
    out.flush()?;
    Ok(())
}

fn write_prompt<W: Write>(out: &mut W, prompt: &str) -> io::Result<()> {
    write!(out, "{prompt}")?;
    out.flush()
}

fn print_prompt(prompt: &str) {
    let _ = write_prompt(&mut io::stdout().lock(), prompt);
}
