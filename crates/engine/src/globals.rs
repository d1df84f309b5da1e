//! Global engine context storage
//!
//! The context is created once during load and dropped on unload. C ABI
//! entry points reach it through [`with_engine`]; hook dispatch goes through
//! [`hooks`], which hands out the shared registry so callbacks never run
//! under the context lock.

use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::RwLock;

use vulpes_core::{EngineContext, HookRegistry};

use crate::error::LoaderError;

struct EngineGlobals {
    context: EngineContext,
    hooks: Arc<HookRegistry>,
    /// Thread that loaded the engine; the host's main thread
    main_thread_id: ThreadId,
}

/// Global engine state storage
static ENGINE: RwLock<Option<EngineGlobals>> = RwLock::new(None);

/// Install the context for this load cycle
///
/// Returns error if already initialized.
pub fn init_engine(context: EngineContext) -> Result<(), LoaderError> {
    let mut engine = ENGINE.write();
    if engine.is_some() {
        return Err(LoaderError::AlreadyInitialized);
    }

    let hooks = context.hooks();
    *engine = Some(EngineGlobals {
        context,
        hooks,
        main_thread_id: std::thread::current().id(),
    });
    Ok(())
}

/// Remove and tear down the context, reverting every patch.
///
/// Returns the number of reverts that failed.
pub fn shutdown_engine() -> Result<usize, LoaderError> {
    // Take the context out first so teardown runs without the lock held
    let globals = ENGINE.write().take().ok_or(LoaderError::NotInitialized)?;
    let mut context = globals.context;
    let failures = context.teardown();
    drop(context);
    Ok(failures)
}

/// Run `f` with exclusive access to the context
pub fn with_engine<R>(f: impl FnOnce(&mut EngineContext) -> R) -> Result<R, LoaderError> {
    let mut engine = ENGINE.write();
    let globals = engine.as_mut().ok_or(LoaderError::NotInitialized)?;
    Ok(f(&mut globals.context))
}

/// The shared hook registry, if the engine is loaded
pub fn hooks() -> Option<Arc<HookRegistry>> {
    ENGINE.read().as_ref().map(|g| Arc::clone(&g.hooks))
}

/// Check if engine is initialized
pub fn is_engine_initialized() -> bool {
    ENGINE.read().is_some()
}

/// Check if current thread is the thread that loaded the engine
pub fn is_main_thread() -> bool {
    ENGINE
        .read()
        .as_ref()
        .map(|g| std::thread::current().id() == g.main_thread_id)
        .unwrap_or(false)
}
