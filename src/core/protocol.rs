//! Text protocol spoken over the secure relay channel.
//!
//! Every message is one comma-separated line. It is decoded into a typed
//! enum once, at the channel boundary, and encoded back with `encode`.

use crate::utils::{P2PError, Result};

pub const TAG_USERNAME_OK: &str = "USERNAMEOK";
pub const TAG_USERNAME_TAKEN: &str = "USERNAMETAKEN";
pub const TAG_SEARCH: &str = "SEARCH";
pub const TAG_RESULT: &str = "RESULT";
pub const TAG_DOWNLOAD: &str = "DOWNLOAD";
pub const TAG_DISCONNECT: &str = "DISCONNECT";

pub const MAX_USERNAME_LEN: usize = 32;

/// Peer to server, once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Search { text: String },
    Result { to: String, file_name: String },
    Download(DownloadRequest),
    Disconnect,
}

/// Asks the server to tell `uploader` to push `file_name` to the given
/// address, authorized by `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub uploader: String,
    pub file_name: String,
    pub address: String,
    pub port: u16,
    pub key: String,
}

/// Server to peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    UsernameOk,
    UsernameTaken,
    Search { from: String, text: String },
    Result { from: String, file_name: String },
    Download(TransferOffer),
    Disconnect,
}

/// A relayed [`DownloadRequest`] as seen by the uploader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOffer {
    pub file_name: String,
    pub address: String,
    pub port: u16,
    pub key: String,
}

impl DownloadRequest {
    pub fn into_offer(self) -> TransferOffer {
        TransferOffer {
            file_name: self.file_name,
            address: self.address,
            port: self.port,
            key: self.key,
        }
    }
}

impl ClientMessage {
    pub fn encode(&self) -> String {
        match self {
            ClientMessage::Search { text } => format!("{},{}", TAG_SEARCH, text),
            ClientMessage::Result { to, file_name } => {
                format!("{},{},{}", TAG_RESULT, to, file_name)
            }
            ClientMessage::Download(req) => format!(
                "{},{},{},{},{},{}",
                TAG_DOWNLOAD, req.uploader, req.file_name, req.address, req.port, req.key
            ),
            ClientMessage::Disconnect => TAG_DISCONNECT.to_string(),
        }
    }

    pub fn decode(line: &str) -> Result<Self> {
        let (tag, rest) = split_tag(line);
        match (tag, rest) {
            (TAG_DISCONNECT, None) => Ok(ClientMessage::Disconnect),
            (TAG_SEARCH, Some(text)) => Ok(ClientMessage::Search {
                text: text.to_string(),
            }),
            (TAG_RESULT, Some(rest)) => {
                let (to, file_name) = split_head(rest, line)?;
                Ok(ClientMessage::Result {
                    to: to.to_string(),
                    file_name: file_name.to_string(),
                })
            }
            (TAG_DOWNLOAD, Some(rest)) => {
                let (uploader, rest) = split_head(rest, line)?;
                let (file_name, address, port, key) = split_coordinates(rest, line)?;
                Ok(ClientMessage::Download(DownloadRequest {
                    uploader: uploader.to_string(),
                    file_name,
                    address,
                    port,
                    key,
                }))
            }
            _ => Err(malformed(line)),
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        match self {
            ServerMessage::UsernameOk => TAG_USERNAME_OK.to_string(),
            ServerMessage::UsernameTaken => TAG_USERNAME_TAKEN.to_string(),
            ServerMessage::Search { from, text } => format!("{},{},{}", TAG_SEARCH, from, text),
            ServerMessage::Result { from, file_name } => {
                format!("{},{},{}", TAG_RESULT, from, file_name)
            }
            ServerMessage::Download(offer) => format!(
                "{},{},{},{},{}",
                TAG_DOWNLOAD, offer.file_name, offer.address, offer.port, offer.key
            ),
            ServerMessage::Disconnect => TAG_DISCONNECT.to_string(),
        }
    }

    pub fn decode(line: &str) -> Result<Self> {
        let (tag, rest) = split_tag(line);
        match (tag, rest) {
            (TAG_USERNAME_OK, None) => Ok(ServerMessage::UsernameOk),
            (TAG_USERNAME_TAKEN, None) => Ok(ServerMessage::UsernameTaken),
            (TAG_DISCONNECT, None) => Ok(ServerMessage::Disconnect),
            (TAG_SEARCH, Some(rest)) => {
                let (from, text) = split_head(rest, line)?;
                Ok(ServerMessage::Search {
                    from: from.to_string(),
                    text: text.to_string(),
                })
            }
            (TAG_RESULT, Some(rest)) => {
                let (from, file_name) = split_head(rest, line)?;
                Ok(ServerMessage::Result {
                    from: from.to_string(),
                    file_name: file_name.to_string(),
                })
            }
            (TAG_DOWNLOAD, Some(rest)) => {
                let (file_name, address, port, key) = split_coordinates(rest, line)?;
                Ok(ServerMessage::Download(TransferOffer {
                    file_name,
                    address,
                    port,
                    key,
                }))
            }
            _ => Err(malformed(line)),
        }
    }
}

/// Usernames end up as comma-separated fields, so commas and control
/// characters are refused, as is the bare `DISCONNECT` tag.
pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.chars().count() <= MAX_USERNAME_LEN
        && username != TAG_DISCONNECT
        && !username.chars().any(|c| c == ',' || c.is_control())
}

fn split_tag(line: &str) -> (&str, Option<&str>) {
    match line.split_once(',') {
        Some((tag, rest)) => (tag, Some(rest)),
        None => (line, None),
    }
}

fn split_head<'a>(rest: &'a str, line: &str) -> Result<(&'a str, &'a str)> {
    match rest.split_once(',') {
        Some((head, tail)) if !head.is_empty() => Ok((head, tail)),
        _ => Err(malformed(line)),
    }
}

/// Parses `<file>,<address>,<port>,<key>` from the right so the file name may
/// itself contain commas.
fn split_coordinates(rest: &str, line: &str) -> Result<(String, String, u16, String)> {
    let mut fields = rest.rsplitn(4, ',');
    let key = fields.next().ok_or_else(|| malformed(line))?;
    let port = fields.next().ok_or_else(|| malformed(line))?;
    let address = fields.next().ok_or_else(|| malformed(line))?;
    let file_name = fields.next().ok_or_else(|| malformed(line))?;

    if file_name.is_empty() || address.is_empty() || key.is_empty() {
        return Err(malformed(line));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| P2PError::InvalidMessage(format!("invalid port in: {}", line)))?;

    Ok((
        file_name.to_string(),
        address.to_string(),
        port,
        key.to_string(),
    ))
}

fn malformed(line: &str) -> P2PError {
    P2PError::InvalidMessage(format!("malformed message: {}", line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_search_keeps_commas_in_text() {
        let msg = ClientMessage::decode("SEARCH,annual, report").unwrap();
        assert_eq!(
            msg,
            ClientMessage::Search {
                text: "annual, report".to_string()
            }
        );
        assert_eq!(msg.encode(), "SEARCH,annual, report");
    }

    #[test]
    fn test_client_result_and_disconnect() {
        assert_eq!(
            ClientMessage::decode("RESULT,alice,Report_Final.pdf").unwrap(),
            ClientMessage::Result {
                to: "alice".to_string(),
                file_name: "Report_Final.pdf".to_string()
            }
        );
        assert_eq!(ClientMessage::decode("DISCONNECT").unwrap(), ClientMessage::Disconnect);
    }

    #[test]
    fn test_download_request_with_comma_in_file_name() {
        let line = "DOWNLOAD,bob,a,b.txt,10.0.0.5,5001,0A1B2C3D4E";
        let msg = ClientMessage::decode(line).unwrap();
        let ClientMessage::Download(req) = &msg else {
            panic!("expected download, got {:?}", msg);
        };
        assert_eq!(req.uploader, "bob");
        assert_eq!(req.file_name, "a,b.txt");
        assert_eq!(req.address, "10.0.0.5");
        assert_eq!(req.port, 5001);
        assert_eq!(req.key, "0A1B2C3D4E");
        assert_eq!(msg.encode(), line);
    }

    #[test]
    fn test_relayed_download_drops_uploader() {
        let req = DownloadRequest {
            uploader: "bob".to_string(),
            file_name: "notes.txt".to_string(),
            address: "127.0.0.1".to_string(),
            port: 5000,
            key: "FFFFFFFFFF".to_string(),
        };
        let relayed = ServerMessage::Download(req.into_offer());
        assert_eq!(relayed.encode(), "DOWNLOAD,notes.txt,127.0.0.1,5000,FFFFFFFFFF");
        assert_eq!(ServerMessage::decode(&relayed.encode()).unwrap(), relayed);
    }

    #[test]
    fn test_encoded_messages_lead_with_their_tag() {
        let client = [
            (ClientMessage::Search { text: "q".to_string() }, TAG_SEARCH),
            (ClientMessage::Disconnect, TAG_DISCONNECT),
        ];
        for (msg, tag) in client {
            assert!(msg.encode().starts_with(tag));
            assert!(!msg.encode().contains(&['\n', '{', '"'][..]));
        }

        let server = [
            (ServerMessage::UsernameOk, TAG_USERNAME_OK),
            (ServerMessage::UsernameTaken, TAG_USERNAME_TAKEN),
            (
                ServerMessage::Result {
                    from: "bob".to_string(),
                    file_name: "a.txt".to_string(),
                },
                TAG_RESULT,
            ),
        ];
        for (msg, tag) in server {
            assert!(msg.encode().starts_with(tag));
            assert!(!msg.encode().contains(&['\n', '{', '"'][..]));
        }
    }

    #[test]
    fn test_server_messages() {
        assert_eq!(ServerMessage::decode("USERNAMEOK").unwrap(), ServerMessage::UsernameOk);
        assert_eq!(
            ServerMessage::decode("USERNAMETAKEN").unwrap(),
            ServerMessage::UsernameTaken
        );
        assert_eq!(
            ServerMessage::decode("SEARCH,alice,report").unwrap(),
            ServerMessage::Search {
                from: "alice".to_string(),
                text: "report".to_string()
            }
        );
        assert_eq!(
            ServerMessage::decode("RESULT,bob,x,y.pdf").unwrap(),
            ServerMessage::Result {
                from: "bob".to_string(),
                file_name: "x,y.pdf".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_messages_rejected() {
        for line in [
            "",
            "HELLO",
            "SEARCH",
            "RESULT,alice",
            "RESULT,,file",
            "DOWNLOAD,bob,file,addr,notaport,key",
            "DOWNLOAD,bob,addr,5000,key",
            "USERNAMEOK,extra",
        ] {
            assert!(
                matches!(ClientMessage::decode(line), Err(P2PError::InvalidMessage(_))),
                "client accepted {:?}",
                line
            );
        }
        assert!(ServerMessage::decode("DOWNLOAD,file,addr,99999,key").is_err());
    }

    #[test]
    fn test_username_validation() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username("Bob Smith"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("a,b"));
        assert!(!is_valid_username("tab\there"));
        assert!(!is_valid_username("DISCONNECT"));
        assert!(!is_valid_username(&"x".repeat(MAX_USERNAME_LEN + 1)));
    }
}
