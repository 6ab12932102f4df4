use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{HeartbeatService, KillService};
use crate::server::ServerClient;
use crate::state_machine::KillSource;

/// Periodic heartbeat to the server for the claimed job.
///
/// The server answers each beat; a `kill_requested` answer is how kill
/// requests made through its API reach this agent.
pub struct HttpHeartbeat {
    client: Arc<ServerClient>,
    agent_id: String,
    interval: Duration,
    kill: Arc<KillService>,
    connected: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpHeartbeat {
    pub fn new(
        client: Arc<ServerClient>,
        agent_id: &str,
        interval: Duration,
        kill: Arc<KillService>,
    ) -> Self {
        Self {
            client,
            agent_id: agent_id.to_string(),
            interval,
            kill,
            connected: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }
}

impl HeartbeatService for HttpHeartbeat {
    fn start(&self, job_id: &str) {
        let Ok(mut slot) = self.task.lock() else {
            return;
        };
        if slot.is_some() {
            warn!(job_id, "Heartbeat already started");
            return;
        }

        let client = Arc::clone(&self.client);
        let kill = Arc::clone(&self.kill);
        let connected = Arc::clone(&self.connected);
        let agent_id = self.agent_id.clone();
        let job_id = job_id.to_string();
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        *slot = Some(tokio::spawn(async move {
            loop {
                ticker.tick().await;
                match client.heartbeat(&job_id, &agent_id).await {
                    Ok(response) => {
                        if !connected.swap(true, Ordering::SeqCst) {
                            info!(%job_id, "Heartbeat connected");
                        }
                        if response.kill_requested {
                            kill.kill(KillSource::ApiKillRequest);
                        }
                    }
                    Err(e) => {
                        if connected.swap(false, Ordering::SeqCst) {
                            warn!(%job_id, error = %e, "Heartbeat lost");
                        } else {
                            debug!(%job_id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        }));
    }

    fn stop(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
                info!("Heartbeat stopped");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for HttpHeartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{ExecutionContext, JobSource};
    use crate::testing::FakeProcess;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn heartbeat(server: &MockServer) -> (HttpHeartbeat, Arc<ExecutionContext>, Arc<FakeProcess>) {
        let ctx = Arc::new(ExecutionContext::new(
            "agent-1",
            JobSource::Preresolved("job-1".into()),
        ));
        let process = Arc::new(FakeProcess::exiting_with(0));
        let kill = Arc::new(KillService::new(Arc::clone(&ctx), process.clone()));
        let client = Arc::new(ServerClient::with_base_url(&server.uri()).unwrap());
        let heartbeat = HttpHeartbeat::new(client, "agent-1", Duration::from_millis(20), kill);
        (heartbeat, ctx, process)
    }

    #[tokio::test]
    async fn beats_report_connection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/jobs/job-1/heartbeat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let (heartbeat, ctx, _) = heartbeat(&server);
        assert!(!heartbeat.is_connected());
        heartbeat.start("job-1");
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(heartbeat.is_connected());
        assert!(!ctx.is_abort_requested());
        heartbeat.stop();
        assert!(!heartbeat.is_connected());
    }

    #[tokio::test]
    async fn server_kill_request_aborts_execution() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/jobs/job-1/heartbeat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "kill_requested": true })),
            )
            .mount(&server)
            .await;

        let (heartbeat, ctx, process) = heartbeat(&server);
        heartbeat.start("job-1");
        tokio::time::sleep(Duration::from_millis(150)).await;
        heartbeat.stop();

        assert!(ctx.is_abort_requested());
        assert_eq!(ctx.kill_source(), Some(KillSource::ApiKillRequest));
        assert_eq!(process.kill_source(), Some(KillSource::ApiKillRequest));
    }

    #[tokio::test]
    async fn failing_beats_are_not_connected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (heartbeat, ctx, _) = heartbeat(&server);
        heartbeat.start("job-1");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!heartbeat.is_connected());
        assert!(!ctx.is_abort_requested());
    }
}
