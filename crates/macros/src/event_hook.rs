//! `#[event_hook]` implementation

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{ItemFn, ReturnType};

use crate::parse::{event_variant, EventHookArgs, EVENTS};

pub fn generate_event_hook(args: EventHookArgs, func: ItemFn) -> TokenStream {
    let Some(variant) = event_variant(&args.event) else {
        let known: Vec<_> = EVENTS.iter().map(|(name, _)| *name).collect();
        return syn::Error::new_spanned(
            &func.sig.ident,
            format!("unknown event `{}`, expected one of: {}", args.event, known.join(", ")),
        )
        .to_compile_error();
    };

    if !func.sig.inputs.is_empty()
        || !matches!(func.sig.output, ReturnType::Default)
        || func.sig.asyncness.is_some()
    {
        return syn::Error::new_spanned(&func.sig, "event hooks must be `fn()`").to_compile_error();
    }

    let fn_name = &func.sig.ident;
    let fn_vis = &func.vis;
    let variant = format_ident!("{}", variant);
    let register_fn_name = format_ident!("{}_register", fn_name);
    let unregister_fn_name = format_ident!("{}_unregister", fn_name);

    quote! {
        #func

        /// Add this hook to its event list
        #fn_vis fn #register_fn_name(registry: &::vulpes_core::hooks::HookRegistry) -> bool {
            registry.add(::vulpes_core::hooks::HookEvent::#variant, #fn_name)
        }

        /// Remove this hook from its event list
        #fn_vis fn #unregister_fn_name(registry: &::vulpes_core::hooks::HookRegistry) -> bool {
            registry.remove(::vulpes_core::hooks::HookEvent::#variant, #fn_name)
        }
    }
}
