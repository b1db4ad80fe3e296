use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use super::*;
use crate::pane::PaneOps;

/// A scripted fake pane: each call to `capture`/`cursor_column` advances
/// through a fixed script, so tests can simulate a chat prompt appearing,
/// the pane going stable, and the injected text showing up on verify.
struct FakePane {
    captures: Mutex<Vec<String>>,
    cursor_columns: Mutex<Vec<u16>>,
    writes: Mutex<Vec<String>>,
}

impl FakePane {
    fn new(captures: Vec<&str>, cursor_columns: Vec<u16>) -> Self {
        Self {
            captures: Mutex::new(captures.into_iter().map(String::from).collect()),
            cursor_columns: Mutex::new(cursor_columns),
            writes: Mutex::new(Vec::new()),
        }
    }

    fn next_capture(&self) -> String {
        let mut captures = self.captures.lock().expect("lock");
        if captures.len() > 1 {
            captures.remove(0)
        } else {
            captures.first().cloned().unwrap_or_default()
        }
    }

    fn next_cursor(&self) -> u16 {
        let mut cols = self.cursor_columns.lock().expect("lock");
        if cols.len() > 1 {
            cols.remove(0)
        } else {
            cols.first().copied().unwrap_or(0)
        }
    }
}

impl PaneOps for FakePane {
    fn capture(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let text = self.next_capture();
        Box::pin(async move { Ok(text) })
    }

    fn cursor_column(&self) -> Pin<Box<dyn Future<Output = Option<u16>> + Send + '_>> {
        let col = self.next_cursor();
        Box::pin(async move { Some(col) })
    }

    fn send_literal(&self, text: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.writes.lock().expect("lock").push(text.to_string());
        Box::pin(async { Ok(()) })
    }

    fn send_enter(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn pane_pid(&self) -> Pin<Box<dyn Future<Output = Option<u32>> + Send + '_>> {
        Box::pin(async { Some(1234) })
    }

    fn kill(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

#[tokio::test]
async fn successful_delivery_is_reported_and_text_appears_in_pane() {
    let pane = FakePane::new(
        vec!["> ", "same", "same", "same", "[from=alice] hello"],
        vec![0, 10],
    );
    let mut injector = Injector::new(CliProfile::generic(), None);
    injector.enqueue("alice".to_string(), "hello".to_string());

    let outcome = injector.tick(&pane, 1_000).await;
    assert_eq!(outcome, Some(InjectionOutcome::Delivered));
    assert!(injector.is_empty());
    assert_eq!(injector.delivery_failures, 0);
}

#[tokio::test]
async fn empty_queue_is_a_no_op() {
    let pane = FakePane::new(vec!["> "], vec![0]);
    let mut injector = Injector::new(CliProfile::generic(), None);
    assert_eq!(injector.tick(&pane, 1_000).await, None);
}

#[tokio::test]
async fn shell_prompt_requeues_without_typing() {
    let pane = FakePane::new(vec!["$ "], vec![0]);
    let mut injector = Injector::new(CliProfile::generic(), None);
    injector.enqueue("alice".to_string(), "hello".to_string());

    let outcome = injector.tick(&pane, 1_000).await;
    assert_eq!(outcome, Some(InjectionOutcome::Requeued));
    assert_eq!(injector.queue_len(), 1);
    assert!(pane.writes.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn repeated_verify_failure_falls_back_to_inbox() {
    let dir = tempfile::tempdir().expect("tempdir");
    let inbox_path = dir.path().join("inbox.md");
    // The prompt always reads as clear/stable, but the injected text never
    // shows up in the capture used for verification.
    let pane = FakePane::new(vec!["> "], vec![0]);
    let mut injector = Injector::new(CliProfile::generic(), Some(inbox_path.clone()));
    injector.enqueue("alice".to_string(), "hello".to_string());

    let outcome = injector.tick(&pane, 1_000).await;
    assert_eq!(outcome, Some(InjectionOutcome::FellBackToInbox));
    assert_eq!(injector.delivery_failures, 1);
    assert!(injector.is_empty());
    let contents = std::fs::read_to_string(&inbox_path).expect("inbox file");
    assert!(contents.contains("hello"));
}

#[test]
fn build_injection_line_collapses_newlines() {
    let msg = PendingMessage { from: "alice".to_string(), body: "line one\nline two".to_string() };
    let line = build_injection_line(&msg, &CliProfile::generic());
    assert_eq!(line, "[from=alice] line one line two");
}

#[test]
fn build_injection_line_wraps_in_backticks_when_configured() {
    let msg = PendingMessage { from: "alice".to_string(), body: "rm -rf /".to_string() };
    let mut profile = CliProfile::generic();
    profile.wrap_in_backticks = true;
    let line = build_injection_line(&msg, &profile);
    assert_eq!(line, "[from=alice] `rm -rf /`");
}
