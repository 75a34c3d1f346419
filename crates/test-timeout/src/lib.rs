use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Options accepted by [`tokio_timeout_test`]:
///
/// * `#[tokio_timeout_test]` - 30 second deadline.
/// * `#[tokio_timeout_test(10)]` or `#[tokio_timeout_test(secs = 10)]`.
/// * `#[tokio_timeout_test(paused)]` - Tokio clock starts paused and
///   auto-advances while the runtime is idle (needs `tokio/test-util`).
struct TestArgs {
    secs: u64,
    paused: bool,
}

impl Parse for TestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TestArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                args.secs = lit.base10_parse()?;
            } else {
                let ident: Ident = input.parse()?;
                match ident.to_string().as_str() {
                    "secs" => {
                        input.parse::<Token![=]>()?;
                        let lit: LitInt = input.parse()?;
                        args.secs = lit.base10_parse()?;
                    }
                    "paused" => args.paused = true,
                    other => {
                        return Err(syn::Error::new(
                            ident.span(),
                            format!("unknown tokio_timeout_test option `{other}`"),
                        ));
                    }
                }
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        if args.secs == 0 {
            return Err(input.error("timeout must be greater than zero"));
        }
        Ok(args)
    }
}

/// Runs an async test on a dedicated current-thread runtime with a hard
/// deadline. The deadline is enforced twice: inside the runtime through
/// `tokio::time::timeout`, and on the wall clock from the calling thread, so
/// a test that blocks its runtime thread still fails instead of hanging.
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

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = args.secs;
    let paused = if args.paused {
        quote!(.start_paused(true))
    } else {
        quote!()
    };
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#name.to_string())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            #paused
                            .build()
                            .expect("failed to build Tokio runtime");
                        runtime.block_on(async {
                            tokio::time::timeout(timeout_duration, async move #block)
                                .await
                                .expect("test timed out");
                        });
                    }));
                    let _ = sender.send(result);
                })
                .expect("failed to spawn test thread");
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
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
