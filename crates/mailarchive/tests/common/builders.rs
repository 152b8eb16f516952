//! Builders for raw messages and source credentials.

#![allow(dead_code)]

use mailarchive::connector::message::{parse_raw_email, RawContext};
use mailarchive::connector::EmailObject;
use mailarchive::factory::{FileImportCredentials, ImapCredentials, ProviderCredentials};

/// Builds an RFC 5322 message, optionally multipart with attachments.
pub struct MessageBuilder {
    message_id: String,
    from: String,
    to: String,
    subject: String,
    body: String,
    date: String,
    attachments: Vec<(String, String, Vec<u8>)>,
}

impl MessageBuilder {
    pub fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            from: "Alice Example <alice@example.com>".to_string(),
            to: "bob@example.com".to_string(),
            subject: format!("Message {}", message_id),
            body: "Hello from the archive tests.".to_string(),
            date: "Tue, 03 Mar 2026 10:15:00 +0000".to_string(),
            attachments: Vec::new(),
        }
    }

    pub fn from(mut self, from: &str) -> Self {
        self.from = from.to_string();
        self
    }

    pub fn to(mut self, to: &str) -> Self {
        self.to = to.to_string();
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    pub fn attachment(mut self, filename: &str, content_type: &str, content: &[u8]) -> Self {
        self.attachments
            .push((filename.to_string(), content_type.to_string(), content.to_vec()));
        self
    }

    pub fn raw(&self) -> Vec<u8> {
        use base64::Engine as _;

        let mut out = format!(
            "Message-ID: <{}>\r\nFrom: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\n",
            self.message_id, self.from, self.to, self.subject, self.date
        );
        if self.attachments.is_empty() {
            out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
            out.push_str(&self.body);
            out.push_str("\r\n");
            return out.into_bytes();
        }

        let boundary = "=_archive_boundary";
        out.push_str(&format!(
            "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
            boundary
        ));
        out.push_str(&format!(
            "--{}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            boundary, self.body
        ));
        for (filename, content_type, content) in &self.attachments {
            out.push_str(&format!(
                "--{}\r\nContent-Type: {}; name=\"{}\"\r\nContent-Disposition: attachment; filename=\"{}\"\r\nContent-Transfer-Encoding: base64\r\n\r\n{}\r\n",
                boundary,
                content_type,
                filename,
                filename,
                base64::engine::general_purpose::STANDARD.encode(content)
            ));
        }
        out.push_str(&format!("--{}--\r\n", boundary));
        out.into_bytes()
    }

    /// Parses the message the way a connector would.
    pub fn build(&self, provider_id: &str, folder: Option<&str>) -> EmailObject {
        parse_raw_email(
            &self.raw(),
            RawContext::new(provider_id).path(folder.map(str::to_string)),
        )
        .expect("builder produced an unparseable message")
    }
}

pub fn imap_credentials() -> ProviderCredentials {
    ProviderCredentials::GenericImap(ImapCredentials {
        host: "imap.example.com".to_string(),
        port: 993,
        secure: true,
        username: "archive@example.com".to_string(),
        password: "hunter2".to_string(),
    })
}

/// An mbox import backed by an uploaded storage key.
pub fn mbox_upload(key: &str) -> ProviderCredentials {
    ProviderCredentials::MboxImport(FileImportCredentials {
        uploaded_file_name: Some("export.mbox".to_string()),
        uploaded_file_path: Some(key.to_string()),
        local_file_path: None,
    })
}
