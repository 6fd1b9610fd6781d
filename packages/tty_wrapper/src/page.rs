use axum::{extract::State, response::Html};
use maud::{DOCTYPE, PreEscaped, html};

use crate::WrapperState;

pub async fn index(State(state): State<WrapperState>) -> Html<String> {
    let reconnect_ms = state
        .options
        .reconnect
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let markup = html! {
        (DOCTYPE)
        html {
            head {
                meta charset="utf-8";
                title { (state.options.title) }
                link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/xterm@5.3.0/css/xterm.css";
                style { (PreEscaped(CSS)) }
            }
            body data-reconnect-ms=(reconnect_ms) data-permit-write=(state.options.permit_write) {
                div id="terminal" {}
                script src="https://cdn.jsdelivr.net/npm/xterm@5.3.0/lib/xterm.js" {}
                script src="https://cdn.jsdelivr.net/npm/xterm-addon-fit@0.8.0/lib/xterm-addon-fit.js" {}
                script { (PreEscaped(JAVASCRIPT)) }
            }
        }
    };

    Html(markup.into_string())
}

const CSS: &str = r#"
    html, body { margin: 0; height: 100%; background: #000; }
    #terminal { height: 100%; }
"#;

// The socket URL is relative so the page keeps working behind a path-prefix proxy.
const JAVASCRIPT: &str = r#"
    const reconnectMs = Number(document.body.dataset.reconnectMs || 0);
    const permitWrite = document.body.dataset.permitWrite === 'true';
    const term = new Terminal({ cursorBlink: true, disableStdin: !permitWrite });
    const fitAddon = new FitAddon.FitAddon();
    term.loadAddon(fitAddon);
    term.open(document.getElementById('terminal'));
    fitAddon.fit();

    let ws = null;

    function send(msg) {
        if (ws && ws.readyState === WebSocket.OPEN) {
            ws.send(JSON.stringify(msg));
        }
    }

    function connect() {
        const url = new URL('ws', window.location.href);
        url.protocol = url.protocol === 'https:' ? 'wss:' : 'ws:';
        ws = new WebSocket(url);

        ws.onopen = () => send({ type: 'Resize', rows: term.rows, cols: term.cols });

        ws.onmessage = (event) => {
            const msg = JSON.parse(event.data);
            if (msg.type === 'Hello') {
                document.title = msg.title;
            } else if (msg.type === 'Output') {
                term.write(msg.data);
            } else if (msg.type === 'Error') {
                term.write('\r\n\x1b[31m' + msg.message + '\x1b[0m\r\n');
            } else if (msg.type === 'Exited') {
                term.write('\r\n\x1b[33m[process exited]\x1b[0m\r\n');
            }
        };

        ws.onclose = () => {
            if (reconnectMs > 0) {
                term.write('\r\n\x1b[31m[disconnected, reconnecting]\x1b[0m\r\n');
                setTimeout(connect, reconnectMs);
            }
        };
    }

    term.onData((data) => send({ type: 'Input', data }));
    term.onResize(({ rows, cols }) => send({ type: 'Resize', rows, cols }));
    window.addEventListener('resize', () => fitAddon.fit());

    connect();
"#;
