// Procedural macros for the tagbus event bus
// These macros turn annotated methods into bus subscriber bindings

use proc_macro::TokenStream;

mod codegen;
mod model;
mod parse;

/// Generates a registration unit for an impl block.
///
/// Every method annotated with `#[subscribe]` becomes a binding that
/// `EventBus::register` subscribes weakly under the method's tags.
///
/// ```rust,ignore
/// #[subscriber]
/// impl Inbox {
///     #[subscribe(tag = "mail", mode = Async)]
///     fn on_mail(&self, from: &str, unread: u32) {}
///
///     #[subscribe(tags = ["opened", "closed"])]
///     fn on_window(&self, #[tag] tag: &str) {}
/// }
///
/// #[subscriber(extends = Inbox)]
/// impl Mailbox {
///     #[subscribe]
///     fn on_refresh(&self) {}
/// }
/// ```
///
/// With `extends = Parent` the type must implement `AsRef<Parent>`; the
/// parent's bindings are registered first and run against the embedded
/// parent value.
#[proc_macro_attribute]
pub fn subscriber(attr: TokenStream, item: TokenStream) -> TokenStream {
    codegen::subscriber_impl(attr.into(), item.into()).into()
}

/// Marks a method of a `#[subscriber]` impl block as a bus handler.
///
/// Arguments: `tag = "..."` (repeatable), `tags = ["...", ...]` and
/// `mode = Default | Post | Main | Async`.
#[proc_macro_attribute]
pub fn subscribe(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let error = parse::standalone_error().to_compile_error();
    let item = proc_macro2::TokenStream::from(item);
    quote::quote!(#error #item).into()
}
