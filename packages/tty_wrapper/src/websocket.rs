use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::WrapperState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    Hello {
        title: String,
        permit_write: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_secs: Option<u64>,
    },
    Input {
        data: String,
    },
    Output {
        data: String,
    },
    Resize {
        rows: u16,
        cols: u16,
    },
    Error {
        message: String,
    },
    Exited,
}

type WsSender = SplitSink<WebSocket, Message>;

async fn send_json(sender: &mut WsSender, msg: &WsMessage) -> Result<(), axum::Error> {
    let Ok(json) = serde_json::to_string(msg) else {
        return Ok(());
    };
    sender.send(Message::Text(json.into())).await
}

pub async fn handle_websocket(socket: WebSocket, state: WrapperState) {
    let (mut sender, mut receiver) = socket.split();

    let hello = WsMessage::Hello {
        title: state.options.title.clone(),
        permit_write: state.options.permit_write,
        reconnect_secs: state.options.reconnect.map(|d| d.as_secs()),
    };
    if send_json(&mut sender, &hello).await.is_err() {
        return;
    }

    // Subscribe before reading the replay so nothing falls in between.
    let mut output_rx = state.session.subscribe_output();
    let replay = state.session.replay().await;
    if !replay.is_empty()
        && send_json(&mut sender, &WsMessage::Output { data: replay })
            .await
            .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = state.closing.cancelled() => {
                let _ = send_json(&mut sender, &WsMessage::Exited).await;
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            event = output_rx.recv() => match event {
                Ok(event) => {
                    if send_json(&mut sender, &WsMessage::Output { data: event.data }).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("WebSocket client lagged, skipped {} output chunks", skipped);
                }
                Err(RecvError::Closed) => {
                    let _ = send_json(&mut sender, &WsMessage::Exited).await;
                    break;
                }
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&state, &mut sender, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket connection closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket receive error: {}", e);
                    break;
                }
            },
        }
    }
}

async fn handle_client_message(state: &WrapperState, sender: &mut WsSender, text: &str) {
    let Ok(msg) = serde_json::from_str::<WsMessage>(text) else {
        debug!("Ignoring malformed client message");
        return;
    };

    let result = match msg {
        WsMessage::Input { data } if state.options.permit_write => {
            state.session.write_input(data.as_bytes()).await.map(|_| ())
        }
        WsMessage::Input { .. } => Err(anyhow::anyhow!("terminal is read-only")),
        WsMessage::Resize { rows, cols } => state.session.resize(rows, cols).await,
        _ => {
            debug!("Unexpected message type from client");
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("Client message failed: {}", e);
        let _ = send_json(
            sender,
            &WsMessage::Error {
                message: e.to_string(),
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_serializes_with_tag() {
        let msg = WsMessage::Hello {
            title: "Terminal 1".to_string(),
            permit_write: true,
            reconnect_secs: Some(10),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Hello");
        assert_eq!(json["title"], "Terminal 1");
        assert_eq!(json["reconnect_secs"], 10);
    }

    #[test]
    fn hello_without_reconnect_omits_field() {
        let msg = WsMessage::Hello {
            title: "t".to_string(),
            permit_write: false,
            reconnect_secs: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("reconnect_secs").is_none());
    }

    #[test]
    fn client_input_parses() {
        let msg: WsMessage = serde_json::from_str(r#"{"type":"Input","data":"ls\n"}"#).unwrap();
        assert_eq!(
            msg,
            WsMessage::Input {
                data: "ls\n".to_string()
            }
        );
    }

    #[test]
    fn client_resize_parses() {
        let msg: WsMessage =
            serde_json::from_str(r#"{"type":"Resize","rows":40,"cols":120}"#).unwrap();
        assert_eq!(msg, WsMessage::Resize { rows: 40, cols: 120 });
    }

    #[test]
    fn exited_is_a_bare_tag() {
        let json = serde_json::to_string(&WsMessage::Exited).unwrap();
        assert_eq!(json, r#"{"type":"Exited"}"#);
    }
}
