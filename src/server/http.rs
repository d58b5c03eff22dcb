//! Just enough HTTP/1.1 for one JSON POST and a chunked response body.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ceiling on the request line plus headers.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Request line and the headers the server cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Path without the query string
    pub path: String,
    pub content_length: Option<usize>,
    pub chunked: bool,
    /// Client waits for `100 Continue` before sending the body
    pub expect_continue: bool,
}

/// A request that is answered with a plain status instead of a frame stream.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed { allow: &'static str },

    #[error("length required")]
    LengthRequired,

    #[error("payload too large (limit {limit} bytes)")]
    PayloadTooLarge { limit: usize },

    #[error("request head too large (limit {limit} bytes)")]
    HeadTooLarge { limit: usize },

    #[error("timed out waiting for the request head")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            HttpError::BadRequest(_) => (400, "Bad Request"),
            HttpError::NotFound => (404, "Not Found"),
            HttpError::MethodNotAllowed { .. } => (405, "Method Not Allowed"),
            HttpError::LengthRequired => (411, "Length Required"),
            HttpError::PayloadTooLarge { .. } => (413, "Payload Too Large"),
            HttpError::HeadTooLarge { .. } => (431, "Request Header Fields Too Large"),
            HttpError::Timeout => (408, "Request Timeout"),
            HttpError::Io(_) => (500, "Internal Server Error"),
        }
    }
}

/// Longest piece of a rejected line echoed back in an error.
const ECHO_LIMIT: usize = 64;

fn excerpt(line: &str) -> String {
    let line = line.trim_end();
    match line.char_indices().nth(ECHO_LIMIT) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}

/// Read one CRLF or LF terminated line, charging its bytes against `budget`.
/// An empty string means the peer closed the connection.
async fn read_head_line<R>(reader: &mut R, budget: &mut usize) -> Result<String, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let (take, done) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        if line.len() + take > *budget {
            return Err(HttpError::HeadTooLarge { limit: MAX_HEAD_BYTES });
        }
        line.extend_from_slice(&available[..take]);
        reader.consume(take);
        if done {
            break;
        }
    }
    *budget -= line.len();
    String::from_utf8(line).map_err(|_| HttpError::BadRequest("request head is not valid UTF-8".to_string()))
}

/// Read the request line and headers. `Ok(None)` when the peer closed the
/// connection before sending anything.
pub async fn read_head<R>(reader: &mut R) -> Result<Option<RequestHead>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;

    let line = read_head_line(reader, &mut budget).await?;
    if line.is_empty() {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(HttpError::BadRequest(format!("malformed request line: {:?}", excerpt(&line))));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::BadRequest(format!("unsupported protocol {}", excerpt(version))));
    }
    let path = target.split('?').next().unwrap_or(target).to_string();
    let method = method.to_ascii_uppercase();

    let mut content_length = None;
    let mut chunked = false;
    let mut expect_continue = false;
    loop {
        let line = read_head_line(reader, &mut budget).await?;
        if line.is_empty() {
            return Err(HttpError::BadRequest("connection closed inside headers".to_string()));
        }

        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        let Some((name, value)) = header.split_once(':') else {
            return Err(HttpError::BadRequest(format!("malformed header: {:?}", excerpt(header))));
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            let length = value
                .parse::<usize>()
                .map_err(|_| HttpError::BadRequest(format!("invalid Content-Length: {}", excerpt(value))))?;
            content_length = Some(length);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.to_ascii_lowercase().contains("chunked");
        } else if name.eq_ignore_ascii_case("expect") {
            expect_continue = value.eq_ignore_ascii_case("100-continue");
        }
    }

    Ok(Some(RequestHead {
        method,
        path,
        content_length,
        chunked,
        expect_continue,
    }))
}

/// Length of an acceptable `Content-Length` body.
pub fn body_length(head: &RequestHead, limit: usize) -> Result<usize, HttpError> {
    let Some(length) = head.content_length.filter(|_| !head.chunked) else {
        return Err(HttpError::LengthRequired);
    };
    if length > limit {
        return Err(HttpError::PayloadTooLarge { limit });
    }
    Ok(length)
}

/// Read a `Content-Length` delimited body of at most `limit` bytes.
pub async fn read_body<R>(reader: &mut R, head: &RequestHead, limit: usize) -> Result<Vec<u8>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let length = body_length(head, limit)?;
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Interim response for a client that sent `Expect: 100-continue`.
pub async fn write_continue<W>(writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
    writer.flush().await
}

/// Write a complete response with a fixed-length body.
pub async fn write_response<W>(
    writer: &mut W,
    status: (u16, &str),
    content_type: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status.0,
        status.1,
        content_type,
        body.len()
    );
    for (name, value) in extra_headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Plain-text error response for a request that never reached the service.
pub async fn write_error<W>(writer: &mut W, error: &HttpError) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let allow;
    let extra: &[(&str, &str)] = match error {
        HttpError::MethodNotAllowed { allow: methods } => {
            allow = [("Allow", *methods)];
            &allow
        }
        _ => &[],
    };
    let body = format!("{}\n", error);
    write_response(writer, error.status(), "text/plain; charset=utf-8", extra, body.as_bytes()).await
}

/// Chunked transfer-encoding writer; every chunk is flushed immediately.
#[derive(Debug)]
pub struct ChunkedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ChunkedWriter<W> {
    /// Send the status line and headers of a streaming 200 response.
    pub async fn start(mut inner: W, content_type: &str) -> std::io::Result<Self> {
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            content_type
        );
        inner.write_all(head.as_bytes()).await?;
        inner.flush().await?;
        Ok(Self { inner })
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.inner.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
        self.inner.write_all(data).await?;
        self.inner.write_all(b"\r\n").await?;
        self.inner.flush().await
    }

    /// Write the terminating zero-length chunk.
    pub async fn finish(mut self) -> std::io::Result<W> {
        self.inner.write_all(b"0\r\n\r\n").await?;
        self.inner.flush().await?;
        Ok(self.inner)
    }
}

/// Undo chunked transfer-encoding of a complete response body.
pub fn dechunk(mut body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = body.windows(2).position(|w| w == b"\r\n")?;
        let size_text = std::str::from_utf8(&body[..line_end]).ok()?;
        let size = usize::from_str_radix(size_text.split(';').next()?.trim(), 16).ok()?;
        body = &body[line_end + 2..];
        if size == 0 {
            return Some(out);
        }
        if body.len() < size + 2 {
            return None;
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}
