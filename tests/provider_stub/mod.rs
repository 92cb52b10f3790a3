use std::collections::HashMap;
use std::io::Read as _;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

/// tiny_http stand-in for the upstream text provider: `/v3/texts/<ref>`,
/// `/links/<ref>`, and `/v2/index/<book>`, fed from per-test fixtures.
pub struct ProviderStub {
    pub base_url: String,
    state: Arc<Mutex<ProviderState>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[derive(Default)]
struct ProviderState {
    /// ref -> nested `he` value
    texts: HashMap<String, Value>,
    /// ref -> links array
    links: HashMap<String, Value>,
    /// book -> chapter count
    index_lengths: HashMap<String, u64>,
    requests: Vec<String>,
}

impl ProviderStub {
    pub fn spawn() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start provider stub");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");
        let state = Arc::new(Mutex::new(ProviderState::default()));

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let loop_state = Arc::clone(&state);

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = request.url().to_string();
                let path = url.split('?').next().unwrap_or(&url).to_string();
                let decoded = percent_decode(&path);
                loop_state.lock().unwrap().requests.push(decoded.clone());

                let response = route(&loop_state, &decoded);
                let _ = match response {
                    Some(body) => request.respond(
                        tiny_http::Response::from_string(body.to_string()).with_header(
                            tiny_http::Header::from_bytes(
                                &b"Content-Type"[..],
                                &b"application/json"[..],
                            )
                            .expect("content-type header"),
                        ),
                    ),
                    None => request
                        .respond(tiny_http::Response::from_string("not found").with_status_code(404)),
                };
            }
        });

        Self {
            base_url,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn set_text(&self, ref_str: &str, he: Value) {
        self.state
            .lock()
            .unwrap()
            .texts
            .insert(ref_str.to_owned(), he);
    }

    pub fn set_links(&self, ref_str: &str, links: Value) {
        self.state
            .lock()
            .unwrap()
            .links
            .insert(ref_str.to_owned(), links);
    }

    pub fn set_chapter_count(&self, book: &str, count: u64) {
        self.state
            .lock()
            .unwrap()
            .index_lengths
            .insert(book.to_owned(), count);
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }
}

fn route(state: &Arc<Mutex<ProviderState>>, decoded_path: &str) -> Option<Value> {
    let state = state.lock().unwrap();

    if let Some(ref_str) = decoded_path.strip_prefix("/v3/texts/") {
        let he = state.texts.get(ref_str)?;
        return Some(json!({ "ref": ref_str, "he": he }));
    }
    if let Some(ref_str) = decoded_path.strip_prefix("/links/") {
        return Some(
            state
                .links
                .get(ref_str)
                .cloned()
                .unwrap_or_else(|| json!([])),
        );
    }
    if let Some(book) = decoded_path.strip_prefix("/v2/index/") {
        let length = state.index_lengths.get(book)?;
        return Some(json!({ "schema": { "lengths": [length] } }));
    }
    None
}

impl Drop for ProviderStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Scripted LLM endpoint: per-model queues of canned outcomes, plus a
/// default response once a queue drains.
pub struct LlmStub {
    pub base_url: String,
    state: Arc<Mutex<LlmState>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[derive(Clone)]
pub enum LlmBehavior {
    Respond(String),
    Status(u16, String),
}

#[derive(Default)]
struct LlmState {
    scripted: HashMap<String, Vec<LlmBehavior>>,
    default_response: Option<String>,
    calls: Vec<(String, String)>,
}

impl LlmStub {
    pub fn spawn() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start llm stub");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");
        let state = Arc::new(Mutex::new(LlmState::default()));

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let loop_state = Arc::clone(&state);

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                if request.url() != "/v1/generate" {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("bad body").with_status_code(400),
                    );
                    continue;
                }
                let parsed: Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("bad json").with_status_code(400),
                        );
                        continue;
                    }
                };
                let model = parsed
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let prompt = parsed
                    .get("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();

                let behavior = {
                    let mut state = loop_state.lock().unwrap();
                    state.calls.push((model.clone(), prompt));
                    match state.scripted.get_mut(&model) {
                        Some(queue) if !queue.is_empty() => queue.remove(0),
                        _ => match &state.default_response {
                            Some(text) => LlmBehavior::Respond(text.clone()),
                            None => LlmBehavior::Status(
                                500,
                                format!("no scripted behavior for model {model}"),
                            ),
                        },
                    }
                };

                let _ = match behavior {
                    LlmBehavior::Respond(text) => request.respond(
                        tiny_http::Response::from_string(json!({ "text": text }).to_string())
                            .with_header(
                                tiny_http::Header::from_bytes(
                                    &b"Content-Type"[..],
                                    &b"application/json"[..],
                                )
                                .expect("content-type header"),
                            ),
                    ),
                    LlmBehavior::Status(code, body) => request
                        .respond(tiny_http::Response::from_string(body).with_status_code(code)),
                };
            }
        });

        Self {
            base_url,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn script(&self, model: &str, behaviors: Vec<LlmBehavior>) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .insert(model.to_owned(), behaviors);
    }

    pub fn set_default_response(&self, text: &str) {
        self.state.lock().unwrap().default_response = Some(text.to_owned());
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl Drop for LlmStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
