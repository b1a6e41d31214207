use proc_macro::TokenStream;

use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Runs the function body as the driver of a fresh coroutine runtime.
///
/// Coroutines that are still alive when the body returns are torn down.
/// A panic in the body, or in a coroutine, is resumed after teardown.
#[proc_macro_attribute]
pub fn start(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);

    let attributes = &item.attrs;
    let visibility = &item.vis;
    let signature = &item.sig;
    let body = &item.block;

    let result = quote! {
        #(#attributes)*
        #visibility #signature {
            match ::stackful::runtime::start(move || #body) {
                Ok(output) => output,
                Err(payload) => ::std::panic::resume_unwind(payload),
            }
        }
    };

    result.into()
}
