use serde::Deserialize;

use crate::inbound::body::PayloadNode;

// Fields are deserialized from the Gmail API but not all are read directly;
// they exist to match the API contract.

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub(crate) struct GmailProfile {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "historyId")]
    pub history_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub(crate) struct GmailMessageList {
    pub messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    pub result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub(crate) struct GmailMessageStub {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailMessage {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
    #[serde(rename = "labelIds", default)]
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    pub payload: Option<GmailPayload>,
    #[serde(rename = "internalDate")]
    pub internal_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GmailPayload {
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub headers: Option<Vec<GmailHeader>>,
    pub body: Option<GmailBody>,
    pub parts: Option<Vec<GmailPayload>>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct GmailBody {
    pub size: Option<u64>,
    pub data: Option<String>,
    #[serde(rename = "attachmentId")]
    pub attachment_id: Option<String>,
}

impl GmailMessage {
    /// Header value by case-insensitive name, or an empty string.
    pub fn header(&self, name: &str) -> String {
        self.payload
            .as_ref()
            .and_then(|payload| payload.headers.as_deref())
            .unwrap_or_default()
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.clone())
            .unwrap_or_default()
    }

    pub fn payload_tree(&self) -> PayloadNode {
        self.payload
            .as_ref()
            .map(PayloadNode::from)
            .unwrap_or_default()
    }
}

impl From<&GmailPayload> for PayloadNode {
    fn from(payload: &GmailPayload) -> Self {
        PayloadNode {
            mime_type: payload
                .mime_type
                .as_deref()
                .unwrap_or_default()
                .to_ascii_lowercase(),
            data: payload
                .body
                .as_ref()
                .and_then(|body| body.data.clone())
                .filter(|data| !data.is_empty()),
            children: payload
                .parts
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(PayloadNode::from)
                .collect(),
        }
    }
}
