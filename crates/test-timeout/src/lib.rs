//! Watchdog attribute for async tests.
//!
//! `#[tokio_timeout_test]` (default 30s) or `#[tokio_timeout_test(5)]` turns an
//! `async fn` into a plain `#[test]` that drives the body on a current-thread
//! tokio runtime. The body runs on its own thread so a test stuck on a socket
//! or an empty queue fails with "test timed out" instead of hanging the suite.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test expects an async fn",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build tokio runtime for test");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };
    let watchdog = watchdog(body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
            #watchdog
        }
    })
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be at least one second"));
    }
    Ok(secs)
}

/// Runs `body` on a helper thread and re-raises its panic, or fails once
/// `timeout_duration` elapses without a result.
fn watchdog(body: TokenStream2) -> TokenStream2 {
    quote! {
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }
}

// `#[tokio::test]` or `#[test]` stacked on top would register the test twice.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
