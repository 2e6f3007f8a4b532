#![allow(dead_code)]

use archive_harness::config::{self, Config};
use archive_harness::db;
use archive_harness::discovery::{ArchiveState, STATE_FILE};
use archive_harness::jobs::JobStore;
use archive_harness::migrate;
use archive_harness::sources;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub fn write_config(root: &Path, extra: &str) -> PathBuf {
    let content = format!(
        r#"[db]
path = "{root}/data/arh.sqlite"

[worker]
output_root = "{root}/jobs"
poll_interval_secs = 1
max_retries = 3
infra_cooldown_secs = 600
min_free_disk_bytes = 0

[capture]
command = "/bin/true"

[recovery]
state_dir = "{root}/state"
stall_after_mins = 30
min_failure_secs = 600

[sources.hc]
name = "Health Canada"
seeds = ["https://www.canada.ca/en/health-canada.html"]
allowed_hosts = ["www.canada.ca"]

[sources.phac]
name = "Public Health Agency"
seeds = ["https://www.canada.ca/en/public-health.html"]
{extra}
"#,
        root = root.display(),
        extra = extra,
    );

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let path = config_dir.join("arh.toml");
    fs::write(&path, content).unwrap();
    path
}

pub struct Harness {
    pub tmp: TempDir,
    pub config: Config,
    pub store: JobStore,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_extra("").await
    }

    pub async fn with_extra(extra: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let path = write_config(tmp.path(), extra);
        let config = config::load_config(&path).unwrap();
        let pool = db::connect(&config).await.unwrap();
        migrate::create_schema(&pool).await.unwrap();
        sources::sync_sources(&pool, &config).await.unwrap();
        Self {
            tmp,
            config,
            store: JobStore::new(pool),
        }
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }
}

pub struct FixtureRecord {
    pub warc_type: &'static str,
    pub id: String,
    pub uri: String,
    pub date: String,
    pub http: Vec<u8>,
}

pub fn html_response(id: &str, uri: &str, title: &str) -> FixtureRecord {
    let body = format!(
        "<html lang=\"en\"><head><title>{title}</title>\
         <meta name=\"description\" content=\"About {title}.\"></head>\
         <body><h1>{title}</h1><p>The page about {title} and the things it covers.</p></body></html>"
    );
    let http = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    FixtureRecord {
        warc_type: "response",
        id: id.to_string(),
        uri: uri.to_string(),
        date: "2024-03-01T12:00:00Z".to_string(),
        http: http.into_bytes(),
    }
}

pub fn image_response(id: &str, uri: &str) -> FixtureRecord {
    let body = [0x89u8, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];
    let mut http = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    http.extend_from_slice(&body);
    FixtureRecord {
        warc_type: "response",
        id: id.to_string(),
        uri: uri.to_string(),
        date: "2024-03-01T12:00:01Z".to_string(),
        http,
    }
}

fn encode_record(record: &FixtureRecord) -> Vec<u8> {
    let block_type = if record.warc_type == "response" {
        "application/http; msgtype=response"
    } else {
        "application/http; msgtype=request"
    };
    let mut out = format!(
        "WARC/1.0\r\nWARC-Type: {}\r\nWARC-Record-ID: <urn:uuid:{}>\r\nWARC-Target-URI: {}\r\nWARC-Date: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        record.warc_type,
        record.id,
        record.uri,
        record.date,
        block_type,
        record.http.len()
    )
    .into_bytes();
    out.extend_from_slice(&record.http);
    out.extend_from_slice(b"\r\n\r\n");
    out
}

/// Write records as a multi-member `.warc.gz`, one gzip member per record.
pub fn write_warc_gz(path: &Path, records: &[FixtureRecord]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut out = Vec::new();
    for record in records {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&encode_record(record)).unwrap();
        out.extend_from_slice(&encoder.finish().unwrap());
    }
    fs::write(path, out).unwrap();
}

pub fn write_state(output_dir: &Path, attempts: &[&str], complete: bool) {
    fs::create_dir_all(output_dir).unwrap();
    let state = ArchiveState {
        attempt_dirs: attempts.iter().map(PathBuf::from).collect(),
        complete,
    };
    fs::write(
        output_dir.join(STATE_FILE),
        serde_json::to_string(&state).unwrap(),
    )
    .unwrap();
}

/// `files` archive files, each with `html` HTML responses and `other`
/// non-HTML responses, under `<output_dir>/attempt-1/archive/`.
pub fn populate_archive(output_dir: &Path, files: usize, html: usize, other: usize) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for f in 0..files {
        let mut records = Vec::new();
        for i in 0..html {
            records.push(html_response(
                &format!("f{f}-html-{i}"),
                &format!("https://www.canada.ca/en/page-{f}-{i}.html"),
                &format!("Page {f} {i}"),
            ));
        }
        for i in 0..other {
            records.push(image_response(
                &format!("f{f}-img-{i}"),
                &format!("https://www.canada.ca/img/{f}-{i}.png"),
            ));
        }
        let path = output_dir.join(format!("attempt-1/archive/rec-{f:05}.warc.gz"));
        write_warc_gz(&path, &records);
        paths.push(path);
    }
    write_state(output_dir, &["attempt-1"], true);
    paths
}
