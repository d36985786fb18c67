mod common;

use std::rc::Rc;

use common::{fast_config, LatencyFetcher};
use sandbox_bridge::bridge::message_channel;
use sandbox_bridge::js::{RenderPhase, SandboxSession};

const LESSON: &str = r#"<html><head><script src="api.js"></script></head><body>
    <script>
        localStorage.setItem('score', '10');
        var stored = localStorage.getItem('score');
        var sent = sandbox.send('progress', { page: 1 });
        document.write('<p id="done">' + api.ready + '</p>');
    </script>
</body></html>"#;

fn fetcher() -> Rc<LatencyFetcher> {
    Rc::new(LatencyFetcher::new().script("api.js", 10, "var api = { ready: 'yes' };"))
}

#[tokio::test(start_paused = true)]
async fn silent_host_still_runs_every_script() {
    let (context, _host) = message_channel();
    let mut session = SandboxSession::bootstrap(LESSON, Some(context), fetcher(), &fast_config())
        .await
        .expect("bootstrap");
    assert!(session.degraded().is_some());

    let report = session.run().await;
    assert_eq!(report.executed, 2);
    assert_eq!(report.errored, 0);
    assert!(report
        .degraded
        .as_deref()
        .expect("degradation reason")
        .contains("handshake failed"));
    assert_eq!(session.current_phase(), RenderPhase::Complete);
    assert!(session.document_html().contains(r#"<p id="done">yes</p>"#));

    let observed: String = session
        .environment()
        .eval_with(
            "String(stored) + '|' + sent + '|' + localStorage.length + '|' + sandbox.available",
            "read_log.js",
        )
        .expect("read log");
    assert_eq!(observed, "null|false|0|false");
}

#[tokio::test(start_paused = true)]
async fn missing_host_port_degrades_without_waiting() {
    let mut session = SandboxSession::bootstrap(LESSON, None, fetcher(), &fast_config())
        .await
        .expect("bootstrap");
    let report = session.run().await;
    assert_eq!(report.executed, 2);
    assert_eq!(report.degraded.as_deref(), Some("no host port"));
}

#[tokio::test(start_paused = true)]
async fn departed_host_degrades_immediately() {
    let (context, host) = message_channel();
    drop(host);
    let mut session = SandboxSession::bootstrap(LESSON, Some(context), fetcher(), &fast_config())
        .await
        .expect("bootstrap");
    let report = session.run().await;
    assert_eq!(report.executed, 2);
    assert!(report.degraded.is_some());
}
