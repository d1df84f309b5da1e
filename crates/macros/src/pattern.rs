//! `pattern!` implementation

use proc_macro2::TokenStream;
use quote::quote;
use syn::LitStr;

use crate::parse::parse_pattern;

pub fn generate_pattern(literal: LitStr) -> TokenStream {
    let bytes = match parse_pattern(&literal.value()) {
        Ok(bytes) => bytes,
        Err(message) => return syn::Error::new(literal.span(), message).to_compile_error(),
    };

    let elements = bytes.iter().map(|byte| match byte {
        Some(b) => quote! { ::core::option::Option::Some(#b) },
        None => quote! { ::core::option::Option::None },
    });

    quote! {
        ::vulpes_core::signature::Pattern::__from_checked(&[#(#elements),*])
    }
}
