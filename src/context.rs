//! Task-scoped execution context.
//!
//! Every crawl execution runs inside [`scope`], which installs a fresh
//! context slot for the current tokio task. Nested calls (handler → task
//! logger → output dispatch → datasource) recover "which crawl, which
//! process" from here instead of threading parameters through every call.
//!
//! State is entered through [`ContextGuard::enter`]. Dropping the guard
//! clears the local code, the process id, the message accumulator and the
//! script reference, so cleanup happens on every exit path: normal return,
//! early return with `?`, and unwinding panics.
//!
//! Outside a scope the setters do nothing and the getters return `None`.

use std::cell::RefCell;
use std::future::Future;

#[derive(Debug, Default)]
struct ContextState {
    local_code: Option<String>,
    process_id: Option<String>,
    /// `None` means uninitialized; `Some(vec![])` is a freshly reset accumulator.
    messages: Option<Vec<String>>,
    active_source: Option<String>,
    script: Option<String>,
}

tokio::task_local! {
    static CONTEXT: RefCell<ContextState>;
}

/// Run `future` with its own execution-context slot.
pub async fn scope<F: Future>(future: F) -> F::Output {
    CONTEXT
        .scope(RefCell::new(ContextState::default()), future)
        .await
}

/// True when called from inside [`scope`].
pub fn is_active() -> bool {
    CONTEXT.try_with(|_| ()).is_ok()
}

fn with_state<R>(f: impl FnOnce(&mut ContextState) -> R) -> Option<R> {
    CONTEXT.try_with(|cell| f(&mut cell.borrow_mut())).ok()
}

pub fn set_local_code(code: impl Into<String>) {
    let code = code.into();
    with_state(|s| s.local_code = Some(code));
}

pub fn get_local_code() -> Option<String> {
    with_state(|s| s.local_code.clone()).flatten()
}

pub fn clear_local_code() {
    with_state(|s| s.local_code = None);
}

pub fn set_process_id(id: impl Into<String>) {
    let id = id.into();
    with_state(|s| s.process_id = Some(id));
}

pub fn get_process_id() -> Option<String> {
    with_state(|s| s.process_id.clone()).flatten()
}

pub fn clear_process_id() {
    with_state(|s| s.process_id = None);
}

/// Reset the message accumulator to an empty list.
pub fn reset_messages() {
    with_state(|s| s.messages = Some(Vec::new()));
}

/// Append a free-text execution message. Ignored while the accumulator is
/// uninitialized.
pub fn append_message(text: impl Into<String>) {
    let text = text.into();
    with_state(|s| {
        if let Some(messages) = s.messages.as_mut() {
            messages.push(text);
        }
    });
}

/// Take the accumulated messages, leaving an empty accumulator behind.
pub fn drain_messages() -> Vec<String> {
    with_state(|s| s.messages.as_mut().map(std::mem::take))
        .flatten()
        .unwrap_or_default()
}

/// Mark the accumulator as uninitialized.
pub fn clear_messages() {
    with_state(|s| s.messages = None);
}

pub fn messages_initialized() -> bool {
    with_state(|s| s.messages.is_some()).unwrap_or(false)
}

pub fn set_script(name: impl Into<String>) {
    let name = name.into();
    with_state(|s| s.script = Some(name));
}

pub fn get_script() -> Option<String> {
    with_state(|s| s.script.clone()).flatten()
}

pub fn clear_script() {
    with_state(|s| s.script = None);
}

/// Name of the data source currently executing SQL on this task, if any.
pub fn active_source() -> Option<String> {
    with_state(|s| s.active_source.clone()).flatten()
}

/// Point-in-time copy of the context, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub local_code: Option<String>,
    pub process_id: Option<String>,
    pub messages: Option<Vec<String>>,
    pub active_source: Option<String>,
    pub script: Option<String>,
}

impl ContextSnapshot {
    /// True when no slot holds state.
    pub fn is_clear(&self) -> bool {
        *self == ContextSnapshot::default()
    }
}

pub fn snapshot() -> ContextSnapshot {
    with_state(|s| ContextSnapshot {
        local_code: s.local_code.clone(),
        process_id: s.process_id.clone(),
        messages: s.messages.clone(),
        active_source: s.active_source.clone(),
        script: s.script.clone(),
    })
    .unwrap_or_default()
}

/// Holds the per-execution context; clears it on drop.
#[must_use = "the context is cleared as soon as the guard is dropped"]
pub struct ContextGuard {
    _private: (),
}

impl ContextGuard {
    /// Set local code and process id and reset the message accumulator.
    pub fn enter(local_code: impl Into<String>, process_id: impl Into<String>) -> Self {
        set_local_code(local_code);
        set_process_id(process_id);
        reset_messages();
        Self { _private: () }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        clear_local_code();
        clear_process_id();
        clear_messages();
        clear_script();
    }
}

/// Marks a data source as active for the duration of one statement.
///
/// The previous marker is restored on drop, so nested operations unwind
/// correctly.
pub struct ActiveSourceGuard {
    previous: Option<String>,
}

impl ActiveSourceGuard {
    pub fn enter(source_name: &str) -> Self {
        let name = source_name.to_string();
        let previous = with_state(|s| s.active_source.replace(name)).flatten();
        Self { previous }
    }
}

impl Drop for ActiveSourceGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        with_state(|s| s.active_source = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accessors_are_noops_outside_scope() {
        assert!(!is_active());
        set_local_code("x");
        assert_eq!(get_local_code(), None);
        assert!(drain_messages().is_empty());
        assert!(snapshot().is_clear());
    }

    #[tokio::test]
    async fn guard_sets_and_clears_state() {
        scope(async {
            {
                let _guard = ContextGuard::enter("s_p_c", "proc-1");
                assert_eq!(get_local_code().as_deref(), Some("s_p_c"));
                assert_eq!(get_process_id().as_deref(), Some("proc-1"));
                assert!(messages_initialized());
                append_message("first");
                append_message("second");
                assert_eq!(drain_messages(), vec!["first", "second"]);
                assert!(messages_initialized());
                set_script("crawler.lua");
            }
            assert!(snapshot().is_clear());
        })
        .await;
    }

    #[tokio::test]
    async fn guard_clears_on_early_return() {
        async fn failing() -> anyhow::Result<()> {
            let _guard = ContextGuard::enter("s_p_c", "proc-2");
            anyhow::bail!("boom")
        }

        scope(async {
            assert!(failing().await.is_err());
            assert!(snapshot().is_clear());
        })
        .await;
    }

    #[tokio::test]
    async fn append_before_reset_is_ignored() {
        scope(async {
            append_message("lost");
            assert!(!messages_initialized());
            reset_messages();
            append_message("kept");
            assert_eq!(drain_messages(), vec!["kept"]);
        })
        .await;
    }

    #[tokio::test]
    async fn active_source_restores_previous() {
        scope(async {
            let outer = ActiveSourceGuard::enter("a");
            {
                let _inner = ActiveSourceGuard::enter("b");
                assert_eq!(active_source().as_deref(), Some("b"));
            }
            assert_eq!(active_source().as_deref(), Some("a"));
            drop(outer);
            assert_eq!(active_source(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn scopes_are_isolated_between_tasks() {
        let a = tokio::spawn(scope(async {
            let _g = ContextGuard::enter("a", "1");
            tokio::task::yield_now().await;
            get_local_code()
        }));
        let b = tokio::spawn(scope(async {
            let _g = ContextGuard::enter("b", "2");
            tokio::task::yield_now().await;
            get_local_code()
        }));
        assert_eq!(a.await.unwrap().as_deref(), Some("a"));
        assert_eq!(b.await.unwrap().as_deref(), Some("b"));
    }
}
