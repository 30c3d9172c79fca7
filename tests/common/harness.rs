use clap::Parser;
use session_arena::Options;

pub const TEST_SECRET: &str = "test-secret";

fn test_options() -> Options {
    let args: Vec<&str> = vec![
        "session-arena",
        "--shared-secret",
        TEST_SECRET,
        "--bind",
        "127.0.0.1:0",
    ];
    Options::parse_from(args)
}

#[must_use]
pub fn bearer_token(user_id: &str) -> String {
    format!("{TEST_SECRET}:{user_id}")
}

pub struct Harness {
    pub base_url: String,
    pub ws_base: String,
    handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    pub async fn start() -> Self {
        let (app, _coordinator) = session_arena::build_app(test_options()).await.unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            ws_base: format!("ws://{addr}"),
            handle,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
