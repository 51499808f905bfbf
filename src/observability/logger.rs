use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// One structured record per completed request (dropped requests excluded),
/// emitted as a single JSON object per line.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub profile_id: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub user_agent: String,
    pub action: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub status_code: u16,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
}

enum Sink {
    Stdout,
    Stderr,
    File(Mutex<tokio::fs::File>),
}

/// Structured request log sink. Opens at startup; files are appended to and
/// flushed per record.
pub struct Logger {
    sink: Sink,
}

impl Logger {
    pub async fn open(output: &str) -> Result<Self> {
        let sink = match output {
            "" | "stdout" => Sink::Stdout,
            "stderr" => Sink::Stderr,
            path => {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("failed to open log file: {}", path))?;
                Sink::File(Mutex::new(file))
            }
        };

        Ok(Self { sink })
    }

    pub async fn log_request(&self, record: &RequestRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                debug!("failed to serialize request record: {}", e);
                return;
            }
        };

        match &self.sink {
            Sink::Stdout => println!("{}", line),
            Sink::Stderr => eprintln!("{}", line),
            Sink::File(file) => {
                let mut file = file.lock().await;
                let write = async {
                    file.write_all(line.as_bytes()).await?;
                    file.write_all(b"\n").await?;
                    file.flush().await
                };
                if let Err(e) = write.await {
                    debug!("failed to write request record: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> RequestRecord {
        RequestRecord {
            timestamp: Utc::now(),
            request_id: "a".repeat(32),
            profile_id: "web".to_string(),
            client_ip: "10.0.0.1".to_string(),
            method: "GET".to_string(),
            path: "/test".to_string(),
            user_agent: "curl/7.68.0".to_string(),
            action: "deny_decoy".to_string(),
            reason: "no allow rules matched".to_string(),
            labels: vec!["default-deny".to_string()],
            status_code: 200,
            duration_ms: 1.234,
            tls_version: None,
            sni: None,
        }
    }

    #[tokio::test]
    async fn test_file_sink_writes_json_lines() {
        let path = std::env::temp_dir().join(format!(
            "veilgate-log-test-{}.jsonl",
            uuid::Uuid::new_v4().simple()
        ));
        let logger = Logger::open(path.to_str().unwrap()).await.unwrap();

        logger.log_request(&sample_record()).await;
        logger.log_request(&sample_record()).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["profile_id"], "web");
        assert_eq!(parsed["action"], "deny_decoy");
        assert_eq!(parsed["status_code"], 200);
        assert_eq!(parsed["labels"][0], "default-deny");
        // optional fields are omitted, not null
        assert!(parsed.get("tls_version").is_none());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_stdout_sink_opens() {
        assert!(Logger::open("stdout").await.is_ok());
        assert!(Logger::open("").await.is_ok());
        assert!(Logger::open("stderr").await.is_ok());
    }
}
