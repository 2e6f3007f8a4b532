//! Archive Reader: a one-shot iterator over the HTTP responses in a WARC file.
//!
//! Plain `.warc` and multi-member `.warc.gz` files are supported. The reader
//! walks the file front to back exactly once; there is no seeking and no
//! restart. Request, metadata, revisit and other non-response records are
//! skipped without buffering their blocks, and with `html_only` set so are
//! responses whose payload is not HTML.
//!
//! Framing errors (bad version line, missing `Content-Length`, short block)
//! end the iteration after yielding the error, because the reader can no
//! longer find the next record boundary. Problems confined to one record's
//! HTTP message yield an error for that record and iteration continues.

use flate2::read::{GzDecoder, MultiGzDecoder};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use crate::error::ArchiveReadError;
use crate::models::ArchiveRecord;

/// Response blocks above this size are skipped rather than buffered.
const MAX_BLOCK_BYTES: usize = 256 * 1024 * 1024;

pub fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Open an archive file for a single pass.
pub fn open(
    path: &Path,
    html_only: bool,
) -> Result<WarcReader<Box<dyn BufRead + Send>>, ArchiveReadError> {
    let file = File::open(path).map_err(|source| ArchiveReadError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let inner: Box<dyn BufRead + Send> = if is_gzip(path) {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    Ok(WarcReader::new(inner, html_only))
}

enum Block {
    Skipped,
    Oversized(usize),
    Data(Vec<u8>),
}

struct Envelope {
    index: usize,
    headers: Vec<(String, String)>,
    block: Block,
}

impl Envelope {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

pub struct WarcReader<R: BufRead> {
    inner: R,
    html_only: bool,
    index: usize,
    skipped: usize,
    done: bool,
}

impl<R: BufRead> WarcReader<R> {
    pub fn new(inner: R, html_only: bool) -> Self {
        Self {
            inner,
            html_only,
            index: 0,
            skipped: 0,
            done: false,
        }
    }

    /// Records read so far, of any type.
    pub fn records_seen(&self) -> usize {
        self.index
    }

    /// Records passed over because of their type or payload.
    pub fn records_skipped(&self) -> usize {
        self.skipped
    }

    fn io_err(&self, source: io::Error) -> ArchiveReadError {
        ArchiveReadError::Io {
            record_index: self.index,
            source,
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> ArchiveReadError {
        ArchiveReadError::Malformed {
            record_index: self.index,
            reason: reason.into(),
        }
    }

    fn read_envelope(&mut self) -> Result<Option<Envelope>, ArchiveReadError> {
        let mut line = Vec::new();

        // Records are separated by blank lines
        loop {
            line.clear();
            let n = self
                .inner
                .read_until(b'\n', &mut line)
                .map_err(|e| self.io_err(e))?;
            if n == 0 {
                return Ok(None);
            }
            if !trim_eol(&line).is_empty() {
                break;
            }
        }

        let version = String::from_utf8_lossy(trim_eol(&line)).to_string();
        if !version.starts_with("WARC/") {
            let shown: String = version.chars().take(40).collect();
            return Err(self.malformed(format!("expected WARC version line, found {:?}", shown)));
        }

        let mut headers: Vec<(String, String)> = Vec::new();
        loop {
            line.clear();
            let n = self
                .inner
                .read_until(b'\n', &mut line)
                .map_err(|e| self.io_err(e))?;
            if n == 0 {
                return Err(self.malformed("end of file inside record header"));
            }
            let content = trim_eol(&line);
            if content.is_empty() {
                break;
            }
            if matches!(content[0], b' ' | b'\t') {
                if let Some((_, value)) = headers.last_mut() {
                    value.push(' ');
                    value.push_str(String::from_utf8_lossy(content).trim());
                }
                continue;
            }
            let text = String::from_utf8_lossy(content);
            let (name, value) = text
                .split_once(':')
                .ok_or_else(|| self.malformed(format!("bad header line {:?}", text)))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        let length: usize = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .ok_or_else(|| self.malformed("missing Content-Length"))?
            .1
            .parse()
            .map_err(|_| self.malformed("unparseable Content-Length"))?;

        let index = self.index;
        self.index += 1;

        let is_response = headers
            .iter()
            .any(|(k, v)| k == "warc-type" && v.eq_ignore_ascii_case("response"));

        let block = if !is_response || length > MAX_BLOCK_BYTES {
            let copied = io::copy(
                &mut self.inner.by_ref().take(length as u64),
                &mut io::sink(),
            )
            .map_err(|source| ArchiveReadError::Io {
                record_index: index,
                source,
            })? as usize;
            if copied < length {
                return Err(ArchiveReadError::Truncated {
                    record_index: index,
                    expected: length,
                    actual: copied,
                });
            }
            if is_response {
                Block::Oversized(length)
            } else {
                Block::Skipped
            }
        } else {
            let mut data = Vec::with_capacity(length);
            self.inner
                .by_ref()
                .take(length as u64)
                .read_to_end(&mut data)
                .map_err(|source| ArchiveReadError::Io {
                    record_index: index,
                    source,
                })?;
            if data.len() < length {
                return Err(ArchiveReadError::Truncated {
                    record_index: index,
                    expected: length,
                    actual: data.len(),
                });
            }
            Block::Data(data)
        };

        Ok(Some(Envelope {
            index,
            headers,
            block,
        }))
    }

    fn to_record(&self, envelope: Envelope) -> Result<Option<ArchiveRecord>, ArchiveReadError> {
        let data = match &envelope.block {
            Block::Skipped => return Ok(None),
            Block::Oversized(len) => {
                return Err(ArchiveReadError::Malformed {
                    record_index: envelope.index,
                    reason: format!("response block of {} bytes exceeds limit", len),
                })
            }
            Block::Data(data) => data,
        };

        let block_type = envelope.header("content-type").unwrap_or("");
        if !block_type.to_ascii_lowercase().starts_with("application/http") {
            return Ok(None);
        }

        let record_id = envelope
            .header("warc-record-id")
            .map(str::to_string)
            .ok_or_else(|| ArchiveReadError::Malformed {
                record_index: envelope.index,
                reason: "missing WARC-Record-ID".to_string(),
            })?;

        let target_uri = envelope
            .header("warc-target-uri")
            .unwrap_or("")
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string();

        let message = parse_http(data).map_err(|reason| ArchiveReadError::Malformed {
            record_index: envelope.index,
            reason,
        })?;

        let record = ArchiveRecord {
            record_id,
            target_uri,
            warc_date: envelope.header("warc-date").map(str::to_string),
            http_status: message.status,
            headers: message.headers,
            body: message.body,
        };

        if self.html_only && !record.is_html() {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

impl<R: BufRead> Iterator for WarcReader<R> {
    type Item = Result<ArchiveRecord, ArchiveReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.read_envelope() {
                Ok(None) => self.done = true,
                Ok(Some(envelope)) => match self.to_record(envelope) {
                    Ok(Some(record)) => return Some(Ok(record)),
                    Ok(None) => self.skipped += 1,
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

struct HttpMessage {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

fn parse_http(block: &[u8]) -> Result<HttpMessage, String> {
    let (head_end, sep_len) = find(block, b"\r\n\r\n")
        .map(|pos| (pos, 4))
        .or_else(|| find(block, b"\n\n").map(|pos| (pos, 2)))
        .ok_or_else(|| "no end of HTTP headers".to_string())?;

    let head = String::from_utf8_lossy(&block[..head_end]);
    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or("");
    if !status_line.starts_with("HTTP/") {
        return Err(format!("bad HTTP status line {:?}", status_line));
    }
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok());

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let mut body = block[head_end + sep_len..].to_vec();

    let has_token = |name: &str, token: &str| {
        headers
            .iter()
            .filter(|(k, _)| k == name)
            .any(|(_, v)| v.to_ascii_lowercase().contains(token))
    };

    // Writers differ on whether they store the wire encoding; only decode
    // when the bytes actually parse.
    if has_token("transfer-encoding", "chunked") {
        if let Some(decoded) = dechunk(&body) {
            body = decoded;
        }
    }
    if has_token("content-encoding", "gzip") {
        let mut inflated = Vec::new();
        if GzDecoder::new(body.as_slice())
            .read_to_end(&mut inflated)
            .is_ok()
        {
            body = inflated;
        }
    }

    Ok(HttpMessage {
        status,
        headers,
        body,
    })
}

fn dechunk(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0;
    loop {
        let line_end = pos + find(&data[pos..], b"\r\n")?;
        let size_line = std::str::from_utf8(&data[pos..line_end]).ok()?;
        let size = usize::from_str_radix(size_line.split(';').next()?.trim(), 16).ok()?;
        pos = line_end + 2;
        if size == 0 {
            return Some(out);
        }
        let end = pos.checked_add(size)?;
        if end > data.len() {
            return None;
        }
        out.extend_from_slice(&data[pos..end]);
        pos = end;
        if data.get(pos..pos + 2) == Some(b"\r\n".as_slice()) {
            pos += 2;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    fn record(warc_type: &str, id: &str, uri: &str, block_type: &str, block: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write!(
            out,
            "WARC/1.0\r\nWARC-Type: {}\r\nWARC-Record-ID: <urn:uuid:{}>\r\nWARC-Target-URI: {}\r\nWARC-Date: 2024-03-01T12:00:00Z\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            warc_type,
            id,
            uri,
            block_type,
            block.len()
        )
        .unwrap();
        out.extend_from_slice(block);
        out.extend_from_slice(b"\r\n\r\n");
        out
    }

    fn response(id: &str, uri: &str, content_type: &str, body: &str) -> Vec<u8> {
        let http = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
            content_type,
            body.len(),
            body
        );
        record(
            "response",
            id,
            uri,
            "application/http; msgtype=response",
            http.as_bytes(),
        )
    }

    fn read_all(bytes: Vec<u8>, html_only: bool) -> Vec<Result<ArchiveRecord, ArchiveReadError>> {
        WarcReader::new(Cursor::new(bytes), html_only).collect()
    }

    #[test]
    fn reads_html_responses_and_skips_the_rest() {
        let mut bytes = Vec::new();
        bytes.extend(record(
            "warcinfo",
            "0",
            "",
            "application/warc-fields",
            b"software: test\r\n",
        ));
        bytes.extend(record(
            "request",
            "1",
            "https://example.org/",
            "application/http; msgtype=request",
            b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n",
        ));
        bytes.extend(response(
            "2",
            "https://example.org/",
            "text/html; charset=utf-8",
            "<html><title>Hi</title></html>",
        ));
        bytes.extend(response(
            "3",
            "https://example.org/logo.png",
            "image/png",
            "PNGDATA",
        ));

        let mut reader = WarcReader::new(Cursor::new(bytes), true);
        let records: Vec<_> = reader.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_id, "<urn:uuid:2>");
        assert_eq!(records[0].target_uri, "https://example.org/");
        assert_eq!(records[0].http_status, Some(200));
        assert_eq!(records[0].body, b"<html><title>Hi</title></html>");
        assert_eq!(reader.records_seen(), 4);
        assert_eq!(reader.records_skipped(), 3);
    }

    #[test]
    fn html_only_off_keeps_other_responses() {
        let mut bytes = response("a", "https://example.org/", "text/html", "<p>x</p>");
        bytes.extend(response("b", "https://example.org/x.css", "text/css", "p{}"));
        let records = read_all(bytes, false);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn truncated_block_yields_error_then_stops() {
        let mut bytes = response("a", "https://example.org/", "text/html", "<p>ok</p>");
        let mut broken = response("b", "https://example.org/2", "text/html", "<p>cut short</p>");
        broken.truncate(broken.len() - 12);
        bytes.extend(broken);

        let results = read_all(bytes, true);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(ArchiveReadError::Truncated { record_index: 1, .. })
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let results = read_all(b"this is not an archive\n".to_vec(), true);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ArchiveReadError::Malformed { .. })));
    }

    #[test]
    fn bad_http_message_does_not_stop_the_file() {
        let mut bytes = record(
            "response",
            "bad",
            "https://example.org/bad",
            "application/http; msgtype=response",
            b"no status line here",
        );
        bytes.extend(response("good", "https://example.org/", "text/html", "<p>x</p>"));

        let results = read_all(bytes, true);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap().record_id, "<urn:uuid:good>");
    }

    #[test]
    fn decodes_chunked_payload() {
        let http = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nTransfer-Encoding: chunked\r\n\r\n5\r\n<p>hi\r\n4\r\n</p>\r\n0\r\n\r\n";
        let bytes = record(
            "response",
            "c",
            "https://example.org/",
            "application/http; msgtype=response",
            http,
        );
        let records = read_all(bytes, true);
        assert_eq!(records[0].as_ref().unwrap().body, b"<p>hi</p>");
    }

    #[test]
    fn reads_multi_member_gzip_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.warc.gz");
        let mut file = std::fs::File::create(&path).unwrap();
        for id in ["1", "2"] {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&response(id, "https://example.org/", "text/html", "<p>x</p>"))
                .unwrap();
            file.write_all(&encoder.finish().unwrap()).unwrap();
        }
        drop(file);

        let records: Vec<_> = open(&path, true)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn missing_file_is_open_error() {
        let err = open(Path::new("/nonexistent/file.warc.gz"), true).err().unwrap();
        assert!(matches!(err, ArchiveReadError::Open { .. }));
    }
}
