//! Standalone runtime tests.
//!
//! Run with: cargo test --test standalone
//!
//! Starts the runtime the way eventrelay-standalone does, provisions a
//! subscriber against its agent address, and drives events through the
//! shared in-process channel.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eventrelay::client::AgentClient;
use eventrelay::config::Config;
use eventrelay::registry::{RegistryStore, Role, Subscriber};
use eventrelay::standalone::Runtime;

const TOKEN: &str = "standalone-token";
const CHANNEL: &str = "alice-events.fifo";

struct Harness {
    runtime: Runtime,
    client: AgentClient,
    workdir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        let workdir = tempfile::tempdir().unwrap();
        let token_file = workdir.path().join("token");
        let mut file = std::fs::File::create(&token_file).unwrap();
        writeln!(file, "{}", TOKEN).unwrap();

        let mut config = Config::for_test();
        config.agent.bind = "127.0.0.1:0".to_string();
        config.agent.token_file = Some(token_file.display().to_string());
        config.agent.wait = true;
        config.dispatcher.idle_poll_ms = 10;
        config.relay.channels = vec![CHANNEL.to_string()];
        config.relay.idle_poll_ms = 10;

        let runtime = Runtime::start(&config).await.unwrap();
        let agent = runtime.agent_addr().to_string();
        runtime
            .registry()
            .upsert_subscriber(
                &Subscriber::new("alice", Role::User, CHANNEL, TOKEN).with_agent_endpoint(&agent),
            )
            .await
            .unwrap();
        let client = AgentClient::new(&agent, TOKEN, Duration::from_secs(5)).unwrap();

        Self {
            runtime,
            client,
            workdir,
        }
    }

    fn output_file(&self) -> PathBuf {
        self.workdir.path().join("executed.log")
    }

    async fn wait_for_lines(&self, count: usize) -> Vec<String> {
        for _ in 0..300 {
            let lines = read_lines(&self.output_file());
            if lines.len() >= count {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        read_lines(&self.output_file())
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_published_event_runs_subscribed_command() {
    let harness = Harness::start().await;
    harness.client.health().await.unwrap();

    let command = format!(
        "echo '<username> <strategy>' >> '{}'",
        harness.output_file().display()
    );
    harness.client.subscribe("alice", "t1", &command).await.unwrap();

    harness
        .runtime
        .publish(r#"{"event_type":"t1","strategy":"s1"}"#, "producer")
        .await
        .unwrap();

    let lines = harness.wait_for_lines(1).await;
    harness.runtime.shutdown().await;
    assert_eq!(lines, vec!["alice s1".to_string()]);
}

#[tokio::test]
async fn test_events_run_in_publish_order() {
    let harness = Harness::start().await;
    let command = format!("echo '<n>' >> '{}'", harness.output_file().display());
    harness.client.subscribe("alice", "t1", &command).await.unwrap();

    for n in 0..3 {
        harness
            .runtime
            .publish(&format!(r#"{{"event_type":"t1","n":{}}}"#, n), "producer")
            .await
            .unwrap();
    }

    let lines = harness.wait_for_lines(3).await;
    harness.runtime.shutdown().await;
    assert_eq!(lines, vec!["0", "1", "2"]);
}

#[tokio::test]
async fn test_event_the_agent_cannot_run_does_not_block_the_channel() {
    let harness = Harness::start().await;
    // Written behind the agent's back: dispatch sees the subscription, the
    // agent's cache does not, so the agent answers 404.
    harness
        .runtime
        .registry()
        .upsert_subscription("alice", "t1", "echo never")
        .await
        .unwrap();
    let command = format!("echo '<n>' >> '{}'", harness.output_file().display());
    harness.client.subscribe("alice", "t3", &command).await.unwrap();

    harness
        .runtime
        .publish(r#"{"event_type":"t1","n":1}"#, "producer")
        .await
        .unwrap();
    harness
        .runtime
        .publish(r#"{"event_type":"t3","n":3}"#, "producer")
        .await
        .unwrap();

    let lines = harness.wait_for_lines(1).await;
    harness.runtime.shutdown().await;
    assert_eq!(lines, vec!["3"]);
}
