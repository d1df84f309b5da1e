//! vulpes proc macros
//!
//! - `pattern!("...")` - signature pattern checked at compile time
//! - `#[event_hook(event = "...")]` - generate hook registration helpers
//!
//! # Pattern Example
//!
//! ```ignore
//! use vulpes_core::{pattern, Signature};
//!
//! let tick = Signature::new(
//!     "Tick",
//!     true,
//!     pattern!("51 53 68 FF FF 0F 00 68 1F 00 09 00 C6 05 ? ? ? ? 01"),
//! );
//! ```
//!
//! # Event Hook Example
//!
//! ```ignore
//! use vulpes_core::event_hook;
//!
//! #[event_hook(event = "tick")]
//! fn count_ticks() {
//!     TICKS.fetch_add(1, Ordering::Relaxed);
//! }
//!
//! // Generated:
//! // - count_ticks() - the hook itself
//! // - count_ticks_register(&HookRegistry) -> bool
//! // - count_ticks_unregister(&HookRegistry) -> bool
//! ```

mod event_hook;
mod parse;
mod pattern;

use darling::{ast::NestedMeta, FromMeta};
use proc_macro::TokenStream;
use syn::{parse_macro_input, ItemFn, LitStr};

/// Build a `Pattern` from a string literal
///
/// Hex bytes are separated by whitespace; `?` or `??` matches any byte.
/// Malformed, empty and all-wildcard patterns fail to compile.
#[proc_macro]
pub fn pattern(input: TokenStream) -> TokenStream {
    let literal = parse_macro_input!(input as LitStr);
    pattern::generate_pattern(literal).into()
}

/// Attribute macro for event hook registration
///
/// # Arguments
///
/// - `event = "..."` - one of `pre_tick`, `tick`, `pre_map_load`, `map_load`
///
/// # Generated Code
///
/// - The original function, unchanged
/// - `{name}_register(&HookRegistry) -> bool` - add to the event's list
/// - `{name}_unregister(&HookRegistry) -> bool` - remove from it
#[proc_macro_attribute]
pub fn event_hook(attr: TokenStream, item: TokenStream) -> TokenStream {
    let items = match NestedMeta::parse_meta_list(attr.into()) {
        Ok(items) => items,
        Err(e) => return TokenStream::from(darling::Error::from(e).write_errors()),
    };
    let args = match parse::EventHookArgs::from_list(&items) {
        Ok(args) => args,
        Err(e) => return TokenStream::from(e.write_errors()),
    };
    let func = parse_macro_input!(item as ItemFn);
    event_hook::generate_event_hook(args, func).into()
}
