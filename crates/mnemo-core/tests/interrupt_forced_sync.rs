//! The interrupt flag is process-wide, so this scenario has its own binary.

mod common;

use std::fs;
use std::time::Duration;

use common::{TestAgent, hanging, replay, text_reply, tool_reply};
use mnemo_core::core::events::AgentEvent;
use mnemo_core::core::interrupt::{self, InterruptedError};
use mnemo_core::core::memory::SyncReason;
use serde_json::json;

#[tokio::test]
async fn interrupt_mid_stream_archives_pending_calls() {
    let partial = {
        let mut events = text_reply("Half an ans");
        // Drop block stop, message delta and message stop.
        events.truncate(3);
        events
    };
    let mut t = TestAgent::new(vec![
        replay(tool_reply(
            "toolu_1",
            "write",
            &json!({"path": "workspace/draft.md", "content": "draft\n"}),
        )),
        hanging(partial),
    ]);
    let memory_before = fs::read_to_string(t.root().join("context_window.md")).unwrap();

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        interrupt::trigger_ctrl_c();
    });

    let err = t.agent.run_turn("write a draft").await.unwrap_err();
    assert!(err.is::<InterruptedError>(), "{err:#}");

    let archives = t.archives();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].reason, SyncReason::Interrupt);
    assert_eq!(archives[0].entries.len(), 1);
    assert_eq!(archives[0].entries[0].invocation.name, "write");
    assert_eq!(
        fs::read_to_string(t.root().join("context_window.md")).unwrap(),
        memory_before
    );
    assert_eq!(t.agent.context().memory.lock().await.unsynced(), 0);
    assert_eq!(
        fs::read_to_string(t.root().join("workspace/draft.md")).unwrap(),
        "draft\n"
    );

    let mut saw_interrupted = false;
    while let Ok(event) = t.events.try_recv() {
        if let AgentEvent::Interrupted { partial_content } = event.as_ref() {
            assert_eq!(partial_content.as_deref(), None);
            saw_interrupted = true;
        }
    }
    assert!(saw_interrupted);
    interrupt::reset();
}
