use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_DEADLINE_SECS: u64 = 30;

/// Replaces `#[test]` on a synchronous test function and fails the test if
/// the body does not finish within the deadline (seconds, default 30):
///
/// ```ignore
/// #[timebox::timeout]
/// fn finishes_quickly() { ... }
///
/// #[timebox::timeout(5)]
/// fn finishes_very_quickly() { ... }
/// ```
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let deadline_secs = if attr.is_empty() {
        DEFAULT_DEADLINE_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "deadline must be at least one second")
                    .to_compile_error()
                    .into()
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let func = parse_macro_input!(item as ItemFn);
    if func.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "timebox::timeout applies to synchronous test functions only",
        )
        .to_compile_error()
        .into();
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = func;

    // A stray #[test] would make the expansion ambiguous; strip it.
    let kept_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !attr.path().is_ident("test"))
        .collect();

    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#kept_attrs)*
        #vis #sig {
            let deadline = ::std::time::Duration::from_secs(#deadline_secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::sync_channel(1);
            ::std::thread::Builder::new()
                .name(::std::format!("timebox-{}", #name))
                .spawn(move || {
                    let outcome = ::std::panic::catch_unwind(
                        ::std::panic::AssertUnwindSafe(|| #block),
                    );
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn timebox worker thread");
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(value)) => value,
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded its {}s deadline", #deadline_secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("timebox worker thread exited without reporting")
                }
            }
        }
    })
}
