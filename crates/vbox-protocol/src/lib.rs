pub mod paths;

use serde::{Deserialize, Serialize};

/// Identifier of a virtual box.
pub type BoxId = String;
/// Identifier of a user as issued by the identity service.
pub type UserId = String;
/// Full object key of a file or folder (`projects/{boxId}/{relativePath}`).
pub type FileId = String;
/// Client-chosen identifier of a terminal within a box.
pub type TerminalId = String;
/// Server-assigned identifier of one websocket connection.
pub type ConnectionId = String;

/// Room for the request envelope around a `saveFile` body.
pub const FRAME_OVERHEAD_BYTES: usize = 64 * 1024;

/// Smallest frame limit that still carries a `saveFile` body of
/// `max_save_bytes` with every byte escaped as `\u00XX`.
pub const fn frame_limit_for(max_save_bytes: usize) -> usize {
    max_save_bytes
        .saturating_mul(6)
        .saturating_add(FRAME_OVERHEAD_BYTES)
}

pub const DEFAULT_TERMINAL_COLS: u16 = 100;
pub const DEFAULT_TERMINAL_ROWS: u16 = 24;

/// A node of a box's file tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileNode {
    File {
        id: FileId,
        name: String,
    },
    Folder {
        id: FileId,
        name: String,
        children: Vec<FileNode>,
    },
}

impl FileNode {
    pub fn file(id: impl Into<FileId>, name: impl Into<String>) -> Self {
        FileNode::File {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn folder(id: impl Into<FileId>, name: impl Into<String>) -> Self {
        FileNode::Folder {
            id: id.into(),
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            FileNode::File { id, .. } | FileNode::Folder { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FileNode::File { name, .. } | FileNode::Folder { name, .. } => name,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, FileNode::Folder { .. })
    }
}

/// Query parameters of the websocket handshake.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, alias = "virtualboxId")]
    pub box_id: Option<String>,
}

/// Role of an admitted connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Shared,
}

/// Client-to-server requests, one JSON text frame each.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    GetFile {
        file_id: FileId,
    },
    GetFolder {
        folder_id: FileId,
    },
    SaveFile {
        file_id: FileId,
        body: String,
    },
    CreateFile {
        name: String,
    },
    CreateFolder {
        name: String,
    },
    RenameFile {
        file_id: FileId,
        new_name: String,
    },
    MoveFile {
        file_id: FileId,
        folder_id: FileId,
    },
    DeleteFile {
        file_id: FileId,
    },
    DeleteFolder {
        folder_id: FileId,
    },
    CreateTerminal {
        id: TerminalId,
    },
    CloseTerminal {
        id: TerminalId,
    },
    TerminalData {
        id: TerminalId,
        data: String,
    },
    ResizeTerminal {
        #[serde(default)]
        id: Option<TerminalId>,
        cols: u16,
        rows: u16,
    },
    GenerateCode {
        file_name: String,
        code: String,
        line: u32,
        instructions: String,
    },
}

impl ClientRequest {
    /// Wire name of the request, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::GetFile { .. } => "getFile",
            ClientRequest::GetFolder { .. } => "getFolder",
            ClientRequest::SaveFile { .. } => "saveFile",
            ClientRequest::CreateFile { .. } => "createFile",
            ClientRequest::CreateFolder { .. } => "createFolder",
            ClientRequest::RenameFile { .. } => "renameFile",
            ClientRequest::MoveFile { .. } => "moveFile",
            ClientRequest::DeleteFile { .. } => "deleteFile",
            ClientRequest::DeleteFolder { .. } => "deleteFolder",
            ClientRequest::CreateTerminal { .. } => "createTerminal",
            ClientRequest::CloseTerminal { .. } => "closeTerminal",
            ClientRequest::TerminalData { .. } => "terminalData",
            ClientRequest::ResizeTerminal { .. } => "resizeTerminal",
            ClientRequest::GenerateCode { .. } => "generateCode",
        }
    }
}

/// A client request plus the optional correlation id its reply will carry.
/// Requests sent without an id get no reply frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Outcome of one client request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Response {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Response::Ok { data }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

/// Server-to-client frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        #[serde(rename = "requestId")]
        request_id: u64,
        response: Response,
    },
    Event(ServerEvent),
}

/// Events pushed to clients outside the request/reply flow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Loaded {
        files: Vec<FileNode>,
    },
    FilesChanged {
        files: Vec<FileNode>,
    },
    FileRenamed {
        old_id: FileId,
        new_id: FileId,
    },
    DeletePending {
        ids: Vec<FileId>,
    },
    TerminalResponse {
        id: TerminalId,
        data: String,
    },
    TerminalExited {
        id: TerminalId,
        exit_code: Option<u32>,
    },
    RateLimit {
        message: String,
    },
    DisableAccess {
        message: String,
    },
    OwnerDisconnected,
    Presence {
        users: Vec<PresenceEntry>,
    },
}

/// One connected user as shown to collaborators.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub role: Role,
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidHandshake,
    AccessDenied,
    NotFound,
    QuotaExceeded,
    RateLimited,
    InvalidRequest,
    UpstreamUnavailable,
    ServerError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tag_format() {
        let frame = ClientFrame {
            request_id: Some(7),
            request: ClientRequest::GetFile {
                file_id: "projects/b1/a.ts".to_string(),
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "getFile");
        assert_eq!(json["fileId"], "projects/b1/a.ts");
        assert_eq!(json["requestId"], 7);
    }

    #[test]
    fn frame_without_request_id() {
        let json = r#"{"event":"terminalData","id":"t1","data":"ls\r"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.request_id, None);
        assert_eq!(
            frame.request,
            ClientRequest::TerminalData {
                id: "t1".to_string(),
                data: "ls\r".to_string(),
            }
        );
    }

    #[test]
    fn resize_without_terminal_id() {
        let json = r#"{"event":"resizeTerminal","requestId":3,"cols":120,"rows":40}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame.request {
            ClientRequest::ResizeTerminal { id, cols, rows } => {
                assert!(id.is_none());
                assert_eq!(cols, 120);
                assert_eq!(rows, 40);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn generate_code_fields_are_camel_case() {
        let json = r#"{"event":"generateCode","fileName":"a.ts","code":"x","line":4,"instructions":"add"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.request.name(), "generateCode");
    }

    #[test]
    fn file_node_shape() {
        let mut folder = FileNode::folder("projects/b1/src", "src");
        if let FileNode::Folder { children, .. } = &mut folder {
            children.push(FileNode::file("projects/b1/src/a.ts", "a.ts"));
        }
        let json = serde_json::to_value(&folder).unwrap();
        assert_eq!(json["type"], "folder");
        assert_eq!(json["children"][0]["type"], "file");
        assert_eq!(json["children"][0]["name"], "a.ts");
    }

    #[test]
    fn reply_frame_shape() {
        let frame = ServerFrame::Reply {
            request_id: 9,
            response: Response::error(ErrorCode::RateLimited, "slow down"),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "reply");
        assert_eq!(json["requestId"], 9);
        assert_eq!(json["response"]["status"], "error");
        assert_eq!(json["response"]["code"], "rate_limited");
    }

    #[test]
    fn event_frame_shape() {
        let frame = ServerFrame::Event(ServerEvent::FileRenamed {
            old_id: "projects/b1/a.ts".to_string(),
            new_id: "projects/b1/b.ts".to_string(),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"], "fileRenamed");
        assert_eq!(json["newId"], "projects/b1/b.ts");

        let parsed: ServerFrame = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn handshake_accepts_virtualbox_alias() {
        let hs: Handshake =
            serde_json::from_str(r#"{"userId":"u1","virtualboxId":"b1"}"#).unwrap();
        assert_eq!(hs.user_id.as_deref(), Some("u1"));
        assert_eq!(hs.box_id.as_deref(), Some("b1"));
    }
}
