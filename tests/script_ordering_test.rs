mod common;

use std::rc::Rc;
use std::time::Duration;

use common::{fast_config, LatencyFetcher};
use sandbox_bridge::js::{ScriptStatus, SandboxSession};

async fn run(html: &str, fetcher: LatencyFetcher) -> (SandboxSession, String) {
    let mut session = SandboxSession::bootstrap(html, None, Rc::new(fetcher), &fast_config())
        .await
        .expect("bootstrap");
    session.run().await;
    let log: String = session
        .environment()
        .eval_with("log.join(',')", "read_log.js")
        .expect("read log");
    (session, log)
}

#[tokio::test(start_paused = true)]
async fn inline_scripts_run_one_after_another_in_document_order() {
    let html = r#"<html><head><script>var log = ['a'];</script></head>
        <body><script>
            var until = Date.now() + 6;
            while (Date.now() < until) {}
            log.push('b');
        </script><p>text</p><script>log.push('c');</script></body></html>"#;
    let (session, log) = run(html, LatencyFetcher::new()).await;
    assert_eq!(log, "a,b,c");

    let records = &session.report().records;
    assert_eq!(records.len(), 3);
    for pair in records.windows(2) {
        let (earlier, later) = (&pair[0], &pair[1]);
        let earlier_start = earlier.started_at.expect("started");
        let later_start = later.started_at.expect("started");
        assert!(earlier.order < later.order);
        assert!(earlier_start < later_start);
        assert!(earlier.finished_at.expect("finished") <= later_start);
    }

    let busy = &records[1];
    let elapsed = busy.finished_at.expect("finished") - busy.started_at.expect("started");
    assert!(elapsed >= Duration::from_millis(5));
    assert!(records[2].started_at.expect("started") - records[0].started_at.expect("started") >= elapsed);
}

#[tokio::test(start_paused = true)]
async fn externals_execute_in_document_order_whatever_the_latency() {
    let html = r#"<html><head><script>var log = [];</script>
        <script src="slow.js"></script>
        <script src="medium.js"></script>
        <script>log.push('inline');</script>
        <script src="fast.js"></script></head><body></body></html>"#;
    let fetcher = LatencyFetcher::new()
        .script("slow.js", 300, "log.push('slow');")
        .script("medium.js", 120, "log.push('medium');")
        .script("fast.js", 1, "log.push('fast');");

    let (_session, log) = run(html, fetcher).await;
    assert_eq!(log, "slow,medium,inline,fast");
}

#[tokio::test(start_paused = true)]
async fn a_failing_script_does_not_stop_the_queue() {
    let html = r#"<html><head><script>var log = [];</script></head><body>
        <script>log.push('first'); undefinedFunction();</script>
        <script src="missing.js"></script>
        <script>log.push('after');</script></body></html>"#;

    let (session, log) = run(html, LatencyFetcher::new()).await;
    assert_eq!(log, "first,after");

    let report = session.report();
    assert_eq!(report.executed, 2);
    assert_eq!(report.errored, 2);
    let statuses: Vec<ScriptStatus> = report.records.iter().map(|record| record.status).collect();
    assert_eq!(
        statuses,
        vec![
            ScriptStatus::Executed,
            ScriptStatus::Errored,
            ScriptStatus::Errored,
            ScriptStatus::Executed
        ]
    );
    assert!(report.records[1]
        .error
        .as_deref()
        .expect("exception message")
        .contains("undefinedFunction"));
}

#[tokio::test(start_paused = true)]
async fn timers_run_while_waiting_on_a_fetch() {
    let html = r#"<html><head><script>
            var log = ['inline'];
            setTimeout(function () { log.push('timer'); }, 5);
        </script><script src="slow.js"></script></head><body></body></html>"#;
    let fetcher = LatencyFetcher::new().script("slow.js", 50, "log.push('slow');");

    let (_session, log) = run(html, fetcher).await;
    assert_eq!(log, "inline,timer,slow");
}

#[tokio::test(start_paused = true)]
async fn modules_and_data_blocks_are_not_executed() {
    let html = r#"<html><head><script>var log = [];</script>
        <script type="module">log.push('module');</script>
        <script type="text/x-template">log.push('template');</script>
        <script type="text/javascript">log.push('classic');</script></head><body></body></html>"#;
    let (_session, log) = run(html, LatencyFetcher::new()).await;
    assert_eq!(log, "classic");
}
