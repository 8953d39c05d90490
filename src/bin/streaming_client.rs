//! Reference client for manual testing against the streaming server.
//!
//! Grounded on `original_source/tcp_client.py`: connect, send the magic
//! string, send a username frame, stream a PCM file in fixed-size chunks,
//! send `%f`, then print every `%R`/`%E` until `%F` closes the connection.
//! Reuses `whisper_streaming_server::protocol` rather than re-implementing
//! the frame codec, since this binary only differs from the server in
//! which side of the socket it sits on.

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use whisper_streaming_server::protocol::{
    self, CODE_BEGIN, CODE_ERROR, CODE_FINAL, CODE_FINISH, CODE_RESULT, CODE_SPEECH, CODE_USERNAME,
};

/// Matches `tcp_client.py`'s 3200-byte read chunk.
const CHUNK_SIZE: usize = 3200;

#[derive(Debug, Parser)]
#[command(author, version, about = "Reference client for the streaming speech server")]
struct Args {
    /// Server IP address or hostname.
    #[arg(long)]
    ip: String,

    /// Server port.
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Path to a raw 16-bit LE mono PCM file to stream.
    #[arg(long)]
    ifn: std::path::PathBuf,

    /// Username sent in the `%u` frame.
    #[arg(long, default_value = "yc7764")]
    user: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let pcm = tokio::fs::read(&args.ifn).await?;
    let chunks: Vec<&[u8]> = pcm.chunks(CHUNK_SIZE).collect();
    println!("chunks: {}", chunks.len());

    let mut stream = TcpStream::connect((args.ip.as_str(), args.port)).await?;
    stream.write_all(protocol::MAGIC).await?;

    protocol::write_frame(&mut stream, CODE_USERNAME, args.user.as_bytes()).await?;
    let (code, payload) = protocol::read_frame(&mut stream).await?;
    println!("{} {:?}", String::from_utf8_lossy(&code), String::from_utf8_lossy(&payload));

    protocol::write_frame(&mut stream, CODE_BEGIN, b"").await?;

    for chunk in chunks {
        protocol::write_frame(&mut stream, CODE_SPEECH, chunk).await?;
    }
    protocol::write_frame(&mut stream, CODE_FINISH, b"").await?;

    let mut result = String::new();
    loop {
        let (code, payload) = protocol::read_frame(&mut stream).await?;
        let text = String::from_utf8_lossy(&payload).to_string();
        match code {
            CODE_ERROR => continue,
            CODE_RESULT => {
                println!("%R {text}");
                if let Some((_, rhs)) = text.split_once(" : ") {
                    result.push_str(rhs.trim());
                    result.push(' ');
                }
            }
            CODE_FINAL => break,
            _ => {}
        }
    }
    println!("{result}");

    Ok(())
}
