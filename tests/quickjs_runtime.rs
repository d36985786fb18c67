use sandbox_bridge::js::runtime::QuickJsEngine;

#[test]
fn quickjs_executes_inline_script() {
    let engine = QuickJsEngine::new().expect("engine");
    let result: i32 = engine
        .eval_with(
            "(() => { console.log('hello from test'); return 40 + 2; })()",
            "quickjs_runtime_test.js",
        )
        .expect("script result");
    assert_eq!(result, 42);
}

#[test]
fn quickjs_reports_exception_messages() {
    let engine = QuickJsEngine::new().expect("engine");
    let err = engine
        .eval("missingGlobal.call();", "broken_lesson.js")
        .expect_err("reference error");
    assert!(err.to_string().contains("missingGlobal"));
}
