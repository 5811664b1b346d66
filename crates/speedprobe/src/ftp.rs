/// Minimal FTP client: just the commands a speed test needs.
///
/// Control channel replies are read line by line; multi-line replies
/// (`250-...` up to `250 ...`) are folded into one `Reply`. Data channels are
/// plain TCP streams handed back to the caller, who reads or writes them and
/// then calls `finish_transfer` to collect the closing reply.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use speedprobe_types::FtpMode;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

#[derive(Debug, Error)]
pub enum FtpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply to {command}: {code} {text}")]
    UnexpectedReply {
        command: String,
        code: u16,
        text: String,
    },

    #[error("malformed reply: {0}")]
    MalformedReply(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

pub struct FtpClient {
    control: BufStream<TcpStream>,
    timeout: Duration,
    mode: FtpMode,
}

impl FtpClient {
    /// Wrap a connected control socket and consume the server greeting.
    pub async fn new(stream: TcpStream, timeout: Duration) -> Result<Self, FtpError> {
        let mut client = Self {
            control: BufStream::new(stream),
            timeout,
            mode: FtpMode::Passive,
        };
        let greeting = client.read_reply().await?;
        expect(&greeting, &[220], "greeting")?;
        Ok(client)
    }

    pub fn set_mode(&mut self, mode: FtpMode) {
        self.mode = mode;
    }

    pub async fn login(&mut self, user: &str, password: &str) -> Result<(), FtpError> {
        let reply = self.command(&format!("USER {user}")).await?;
        match reply.code {
            230 => Ok(()),
            331 | 332 => {
                let reply = self.command(&format!("PASS {password}")).await?;
                expect(&reply, &[202, 230], "PASS")
            }
            _ => Err(unexpected("USER", reply)),
        }
    }

    pub async fn binary(&mut self) -> Result<(), FtpError> {
        let reply = self.command("TYPE I").await?;
        expect(&reply, &[200], "TYPE")
    }

    /// Remote file size from `MLST`, falling back to `SIZE`.
    pub async fn remote_size(&mut self, path: &str) -> Result<Option<u64>, FtpError> {
        let reply = self.command(&format!("MLST {path}")).await?;
        if reply.code == 250 {
            if let Some(size) = parse_mlst_size(&reply.text) {
                return Ok(Some(size));
            }
        }
        let reply = self.command(&format!("SIZE {path}")).await?;
        if reply.code == 213 {
            return Ok(reply.text.trim().parse().ok());
        }
        Ok(None)
    }

    pub async fn retrieve(&mut self, path: &str) -> Result<TcpStream, FtpError> {
        self.open_data(&format!("RETR {path}")).await
    }

    pub async fn store(&mut self, path: &str) -> Result<TcpStream, FtpError> {
        self.open_data(&format!("STOR {path}")).await
    }

    /// Read the reply that closes a data transfer.
    pub async fn finish_transfer(&mut self) -> Result<(), FtpError> {
        let reply = self.read_reply().await?;
        expect(&reply, &[226, 250], "transfer")
    }

    pub async fn quit(&mut self) -> Result<(), FtpError> {
        let reply = self.command("QUIT").await?;
        expect(&reply, &[221], "QUIT")
    }

    // ── Data channel ────────────────────────────────────────────────────

    async fn open_data(&mut self, command: &str) -> Result<TcpStream, FtpError> {
        match self.mode {
            FtpMode::Passive => {
                let reply = self.command("PASV").await?;
                expect(&reply, &[227], "PASV")?;
                let mut addr = parse_pasv(&reply.text)?;
                if addr.ip().is_unspecified() {
                    if let IpAddr::V4(peer) = self.control.get_ref().peer_addr()?.ip() {
                        addr.set_ip(peer);
                    }
                }
                let data = timed(self.timeout, TcpStream::connect(addr)).await??;
                let reply = self.command(command).await?;
                expect(&reply, &[125, 150], command_name(command))?;
                Ok(data)
            }
            FtpMode::Active => {
                let local_ip = match self.control.get_ref().local_addr()?.ip() {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(_) => {
                        return Err(FtpError::MalformedReply("active mode requires IPv4".into()));
                    }
                };
                let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(local_ip), 0)).await?;
                let port = listener.local_addr()?.port();
                let reply = self
                    .command(&format_port(SocketAddrV4::new(local_ip, port)))
                    .await?;
                expect(&reply, &[200], "PORT")?;
                let reply = self.command(command).await?;
                expect(&reply, &[125, 150], command_name(command))?;
                let (data, _) = timed(self.timeout, listener.accept()).await??;
                Ok(data)
            }
        }
    }

    // ── Control channel ─────────────────────────────────────────────────

    async fn command(&mut self, line: &str) -> Result<Reply, FtpError> {
        if line.starts_with("PASS ") {
            debug!("ftp > PASS ****");
        } else {
            debug!("ftp > {}", line);
        }
        let timeout = self.timeout;
        let control = &mut self.control;
        tokio::time::timeout(timeout, async {
            control.write_all(line.as_bytes()).await?;
            control.write_all(b"\r\n").await?;
            control.flush().await
        })
        .await
        .map_err(|_| FtpError::Timeout(timeout))??;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply, FtpError> {
        let first = self.read_line().await?;
        let code = reply_code(&first)?;
        let mut text = first.get(4..).unwrap_or("").to_string();

        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                let line = self.read_line().await?;
                if line.starts_with(&terminator) || line == code.to_string() {
                    let tail = line.get(4..).unwrap_or("");
                    if !tail.is_empty() {
                        text.push('\n');
                        text.push_str(tail);
                    }
                    break;
                }
                text.push('\n');
                text.push_str(&line);
            }
        }
        debug!("ftp < {} {}", code, text);
        Ok(Reply { code, text })
    }

    async fn read_line(&mut self) -> Result<String, FtpError> {
        let mut line = String::new();
        let n = timed(self.timeout, self.control.read_line(&mut line)).await??;
        if n == 0 {
            return Err(FtpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control connection closed",
            )));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

async fn timed<F: std::future::Future>(timeout: Duration, fut: F) -> Result<F::Output, FtpError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| FtpError::Timeout(timeout))
}

// ── Parsing ─────────────────────────────────────────────────────────────

fn reply_code(line: &str) -> Result<u16, FtpError> {
    line.get(..3)
        .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| FtpError::MalformedReply(line.to_string()))
}

fn expect(reply: &Reply, codes: &[u16], command: &str) -> Result<(), FtpError> {
    if codes.contains(&reply.code) {
        Ok(())
    } else {
        Err(unexpected(command, reply.clone()))
    }
}

fn unexpected(command: &str, reply: Reply) -> FtpError {
    FtpError::UnexpectedReply {
        command: command.to_string(),
        code: reply.code,
        text: reply.text,
    }
}

fn command_name(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or(command)
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
pub fn parse_pasv(text: &str) -> Result<SocketAddrV4, FtpError> {
    let inner = match (text.find('('), text.find(')')) {
        (Some(open), Some(close)) if open < close => &text[open + 1..close],
        _ => text.rsplit(' ').next().unwrap_or(text),
    };
    let parts: Vec<u8> = inner
        .split(',')
        .map(|p| p.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| FtpError::MalformedReply(text.to_string()))?;
    if parts.len() != 6 {
        return Err(FtpError::MalformedReply(text.to_string()));
    }
    let ip = Ipv4Addr::new(parts[0], parts[1], parts[2], parts[3]);
    let port = u16::from(parts[4]) << 8 | u16::from(parts[5]);
    Ok(SocketAddrV4::new(ip, port))
}

pub fn format_port(addr: SocketAddrV4) -> String {
    let [a, b, c, d] = addr.ip().octets();
    let port = addr.port();
    format!("PORT {},{},{},{},{},{}", a, b, c, d, port >> 8, port & 0xff)
}

/// Pull `size=` out of an MLST fact line.
pub fn parse_mlst_size(text: &str) -> Option<u64> {
    text.lines()
        .flat_map(|line| line.split(';'))
        .filter_map(|fact| fact.trim().split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case("size"))
        .and_then(|(_, value)| value.trim().parse().ok())
}
