//! `#[tokio_timeout_test]` runs an async test on a dedicated current-thread
//! runtime and fails it if it does not finish within a wall-clock deadline.
//!
//! Arguments, in any order:
//! - an integer: deadline in seconds (default 30)
//! - `paused`: start the Tokio clock paused so timers advance only when the
//!   runtime is idle (requires Tokio's `test-util` feature in the caller)

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

enum TestArg {
    Seconds(LitInt),
    Paused(Ident),
}

impl Parse for TestArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return input.parse().map(TestArg::Seconds);
        }
        let ident: Ident = input.parse()?;
        if ident == "paused" {
            Ok(TestArg::Paused(ident))
        } else {
            Err(syn::Error::new_spanned(
                ident,
                "expected a timeout in seconds or `paused`",
            ))
        }
    }
}

struct TestArgs {
    timeout_secs: u64,
    paused: bool,
}

impl Parse for TestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TestArgs {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        let parsed = Punctuated::<TestArg, Token![,]>::parse_terminated(input)?;
        for arg in parsed {
            match arg {
                TestArg::Seconds(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    args.timeout_secs = secs;
                }
                TestArg::Paused(_) => args.paused = true,
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TestArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();
    let timeout = args.timeout_secs;
    let pause_clock = if args.paused {
        quote! { builder.start_paused(true); }
    } else {
        quote! {}
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#timeout);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #pause_clock
                    let runtime = builder.build().expect("failed to build Tokio runtime");
                    runtime.block_on(async move #block);
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s wall-clock deadline", #timeout)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
