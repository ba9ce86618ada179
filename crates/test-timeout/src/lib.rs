//! `#[test_timeout::timeout]` runs a synchronous test on its own thread and
//! fails it once a wall-clock deadline passes.
//!
//! Accepted forms: `#[timeout]` (60 s), `#[timeout(5)]`, `#[timeout(secs = 5)]`
//! and `#[timeout(millis = 250)]`.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::Parser;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_MILLIS: u64 = 60_000;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let millis = match parse_deadline(attr) {
        Ok(millis) => millis,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_millis(#millis);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#name.into())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block ));
                    let _ = sender.send(result);
                })
                .expect("spawn test thread");
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} timed out after {:?}", #name, timeout_duration)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn parse_deadline(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_MILLIS);
    }
    if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
        return nonzero(lit.base10_parse::<u64>()?.saturating_mul(1_000), lit.span());
    }

    let mut millis = None;
    let parser = syn::meta::parser(|meta| {
        let scale = if meta.path.is_ident("secs") {
            1_000
        } else if meta.path.is_ident("millis") {
            1
        } else {
            return Err(meta.error("expected `secs` or `millis`"));
        };
        let lit: LitInt = meta.value()?.parse()?;
        millis = Some(nonzero(lit.base10_parse::<u64>()?.saturating_mul(scale), lit.span())?);
        Ok(())
    });
    parser.parse(attr)?;
    millis.ok_or_else(|| syn::Error::new(Span::call_site(), "missing timeout value"))
}

fn nonzero(millis: u64, span: Span) -> syn::Result<u64> {
    if millis == 0 {
        return Err(syn::Error::new(span, "timeout must be greater than zero"));
    }
    Ok(millis)
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
