//! Attribute parsing and per-method validation

use crate::model::{BindingModel, Mode, ParamKind, TagParam, type_string};
use proc_macro2::{Span, TokenStream as TokenStream2};
use syn::parse::{ParseStream, Parser};
use syn::{
    Attribute, Error, Expr, ExprArray, FnArg, GenericArgument, Ident, ImplItemFn, ItemImpl, Lit, LitStr, Path,
    PathArguments, Result, Type, TypePath, TypeReference,
};

/// Helper attributes consumed by `#[subscriber]`
pub const SUBSCRIBE_ATTR: &str = "subscribe";
pub const TAG_ATTR: &str = "tag";

pub fn is_attr(attr: &Attribute, name: &str) -> bool {
    attr.path().is_ident(name)
}

/// Parse the arguments of `#[subscriber(...)]`
pub fn parse_unit_args(args: TokenStream2) -> Result<Option<Path>> {
    let mut parent = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("extends") {
            if parent.is_some() {
                return Err(meta.error("duplicate `extends`"));
            }
            parent = Some(meta.value()?.parse::<Path>()?);
            Ok(())
        } else {
            Err(meta.error("unknown #[subscriber] argument\nhint: the only supported argument is `extends = ParentType`"))
        }
    });
    parser.parse2(args)?;
    Ok(parent)
}

/// Check the impl block itself
pub fn validate_impl(item: &ItemImpl) -> Result<()> {
    if let Some((_, path, _)) = &item.trait_ {
        return Err(Error::new_spanned(
            path,
            "#[subscriber] must be placed on an inherent impl block, not a trait impl",
        ));
    }
    if !item.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &item.generics,
            "#[subscriber] does not support generic impl blocks\nhint: subscriber bindings need a concrete type",
        ));
    }
    if !matches!(item.self_ty.as_ref(), Type::Path(_)) {
        return Err(Error::new_spanned(
            &item.self_ty,
            "#[subscriber] must be placed on the impl block of a named type",
        ));
    }
    Ok(())
}

/// Options given in `#[subscribe(...)]`
#[derive(Debug, Default)]
struct SubscribeArgs {
    tags: Vec<LitStr>,
    mode: Option<Mode>,
}

fn parse_mode(input: ParseStream) -> Result<Mode> {
    let (name, span) = if input.peek(LitStr) {
        let lit: LitStr = input.parse()?;
        (lit.value(), lit.span())
    } else {
        let ident: Ident = input.parse()?;
        (ident.to_string(), ident.span())
    };
    Mode::from_name(&name).ok_or_else(|| {
        Error::new(
            span,
            format!(
                "unknown thread mode `{}`\nhint: expected one of Default, Post, Main, Async",
                name
            ),
        )
    })
}

fn parse_tag_list(input: ParseStream) -> Result<Vec<LitStr>> {
    let array: ExprArray = input.parse()?;
    array
        .elems
        .iter()
        .map(|elem| match elem {
            Expr::Lit(expr) => match &expr.lit {
                Lit::Str(lit) => Ok(lit.clone()),
                other => Err(Error::new_spanned(other, "tags must be string literals")),
            },
            other => Err(Error::new_spanned(other, "tags must be string literals")),
        })
        .collect()
}

fn parse_subscribe_args(attr: &Attribute) -> Result<SubscribeArgs> {
    let mut args = SubscribeArgs::default();
    if matches!(attr.meta, syn::Meta::Path(_)) {
        return Ok(args);
    }

    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("tag") {
            args.tags.push(meta.value()?.parse()?);
            Ok(())
        } else if meta.path.is_ident("tags") {
            args.tags.extend(parse_tag_list(meta.value()?)?);
            Ok(())
        } else if meta.path.is_ident("mode") {
            if args.mode.is_some() {
                return Err(meta.error("duplicate `mode`"));
            }
            args.mode = Some(parse_mode(meta.value()?)?);
            Ok(())
        } else {
            Err(meta.error("unknown #[subscribe] argument\nhint: expected `tag`, `tags` or `mode`"))
        }
    })?;

    let mut seen: Vec<String> = Vec::new();
    for tag in &args.tags {
        let value = tag.value();
        if seen.contains(&value) {
            return Err(Error::new(tag.span(), format!("duplicate tag \"{}\"", value)));
        }
        seen.push(value);
    }
    Ok(args)
}

/// The `#[subscribe]` attribute of a method, if any
pub fn subscribe_attr(method: &ImplItemFn) -> Result<Option<&Attribute>> {
    let mut found = method.attrs.iter().filter(|attr| is_attr(attr, SUBSCRIBE_ATTR));
    let first = found.next();
    if let Some(extra) = found.next() {
        return Err(Error::new_spanned(
            extra,
            "duplicate #[subscribe]\nhint: list several tags in one attribute with `tags = [..]`",
        ));
    }
    Ok(first)
}

fn is_event_path(path: &TypePath) -> bool {
    path.qself.is_none()
        && path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Event" && segment.arguments.is_empty())
}

fn is_str(ty: &Type) -> bool {
    matches!(ty, Type::Path(path) if path.qself.is_none() && path.path.is_ident("str"))
}

fn is_string(ty: &Type) -> bool {
    matches!(ty, Type::Path(path) if path.qself.is_none() && path.path.is_ident("String"))
}

/// Types whose exact runtime type can be checked against a payload value
fn check_plain(ty: &Type) -> Result<()> {
    match ty {
        Type::Path(path) => {
            if let Some(qself) = &path.qself {
                check_plain(&qself.ty)?;
            }
            for segment in &path.path.segments {
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    for arg in &args.args {
                        match arg {
                            GenericArgument::Type(ty) => check_plain(ty)?,
                            GenericArgument::Lifetime(lifetime) if lifetime.ident != "static" => {
                                return Err(Error::new_spanned(
                                    lifetime,
                                    "only 'static lifetimes are allowed in subscriber parameters",
                                ));
                            }
                            _ => {}
                        }
                    }
                } else if let PathArguments::Parenthesized(args) = &segment.arguments {
                    return Err(Error::new_spanned(
                        args,
                        "closure traits cannot be used as subscriber parameters",
                    ));
                }
            }
            Ok(())
        }
        Type::Reference(reference) => match &reference.lifetime {
            Some(lifetime) if lifetime.ident == "static" && reference.mutability.is_none() => {
                check_plain(&reference.elem)
            }
            _ => Err(Error::new_spanned(
                reference,
                "nested references must be `&'static` and immutable",
            )),
        },
        Type::Tuple(tuple) => tuple.elems.iter().try_for_each(check_plain),
        Type::Array(array) => check_plain(&array.elem),
        Type::Paren(paren) => check_plain(&paren.elem),
        Type::Group(group) => check_plain(&group.elem),
        Type::ImplTrait(_) => Err(Error::new_spanned(
            ty,
            "`impl Trait` parameters cannot be matched against a payload\nhint: use a concrete type",
        )),
        Type::TraitObject(_) => Err(Error::new_spanned(
            ty,
            "trait object parameters cannot be matched against a payload\nhint: use a concrete type",
        )),
        Type::Infer(_) => Err(Error::new_spanned(ty, "parameter types must be written out")),
        _ => Err(Error::new_spanned(ty, "unsupported subscriber parameter type")),
    }
}

fn classify_reference(reference: &TypeReference) -> Result<ParamKind> {
    if reference.mutability.is_some() {
        return Err(Error::new_spanned(
            reference,
            "`&mut` parameters are not supported\nhint: payload values are shared",
        ));
    }
    if let Some(lifetime) = &reference.lifetime {
        return Err(Error::new_spanned(
            lifetime,
            "parameter references borrow from the event and cannot name a lifetime\nhint: remove the lifetime",
        ));
    }

    match reference.elem.as_ref() {
        elem if is_str(elem) => Ok(ParamKind::Str),
        Type::Path(path) if is_event_path(path) => Ok(ParamKind::EventRef),
        Type::Slice(_) => Err(Error::new_spanned(
            reference,
            "slice parameters are not supported\nhint: take `&Vec<T>` instead",
        )),
        elem => {
            check_plain(elem)?;
            Ok(ParamKind::Ref(elem.clone()))
        }
    }
}

fn classify(ty: &Type) -> Result<ParamKind> {
    match ty {
        Type::Reference(reference) => classify_reference(reference),
        Type::Path(path) if is_event_path(path) => Ok(ParamKind::EventOwned),
        ty if is_string(ty) => Ok(ParamKind::String),
        Type::Paren(paren) => classify(&paren.elem),
        other => {
            check_plain(other)?;
            Ok(ParamKind::Value(other.clone()))
        }
    }
}

fn tag_param_kind(ty: &Type) -> Option<TagParam> {
    match ty {
        ty if is_string(ty) => Some(TagParam::Owned),
        Type::Reference(reference)
            if reference.mutability.is_none() && reference.lifetime.is_none() && is_str(&reference.elem) =>
        {
            Some(TagParam::Borrowed)
        }
        _ => None,
    }
}

fn push(errors: &mut Option<Error>, error: Error) {
    match errors {
        Some(existing) => existing.combine(error),
        None => *errors = Some(error),
    }
}

/// Validate one `#[subscribe]` method and describe its binding.
///
/// All problems found in the method are reported together.
pub fn analyze_method(type_name: &str, method: &ImplItemFn, attr: &Attribute) -> Result<BindingModel> {
    let mut errors: Option<Error> = None;
    let sig = &method.sig;

    let args = match parse_subscribe_args(attr) {
        Ok(args) => args,
        Err(e) => {
            push(&mut errors, e);
            SubscribeArgs::default()
        }
    };

    if sig.asyncness.is_some() {
        push(&mut errors, Error::new_spanned(sig.asyncness, "subscriber methods cannot be async"));
    }
    if sig.unsafety.is_some() {
        push(&mut errors, Error::new_spanned(sig.unsafety, "subscriber methods cannot be unsafe"));
    }
    if !sig.generics.params.is_empty() {
        push(
            &mut errors,
            Error::new_spanned(&sig.generics, "subscriber methods cannot be generic"),
        );
    }
    if sig.variadic.is_some() {
        push(&mut errors, Error::new_spanned(&sig.variadic, "variadic methods cannot be bound"));
    }

    let mut inputs = sig.inputs.iter();
    match inputs.next() {
        Some(FnArg::Receiver(receiver))
            if receiver.reference.is_some() && receiver.mutability.is_none() && receiver.colon_token.is_none() => {}
        Some(FnArg::Receiver(receiver)) => push(
            &mut errors,
            Error::new_spanned(receiver, "subscriber methods must take `&self`"),
        ),
        _ => push(
            &mut errors,
            Error::new(
                sig.ident.span(),
                "associated functions cannot be bound\nhint: add a `&self` receiver",
            ),
        ),
    }

    let mut tag_param = None;
    let mut params = Vec::new();
    let mut param_types = Vec::new();
    let mut param_names = Vec::new();

    for (index, input) in inputs.enumerate() {
        let FnArg::Typed(pat_type) = input else {
            continue;
        };
        let ty = pat_type.ty.as_ref();
        param_types.push(type_string(ty));

        if let Some(tag_attr) = pat_type.attrs.iter().find(|attr| is_attr(attr, TAG_ATTR)) {
            if index != 0 {
                push(
                    &mut errors,
                    Error::new_spanned(tag_attr, "#[tag] is only allowed on the first parameter"),
                );
            } else if let Some(kind) = tag_param_kind(ty) {
                tag_param = Some(kind);
            } else {
                push(
                    &mut errors,
                    Error::new_spanned(ty, "#[tag] parameter must be `String` or `&str`"),
                );
            }
            continue;
        }

        match classify(ty) {
            Ok(kind) => {
                params.push(kind);
                param_names.push(type_string(ty));
            }
            Err(e) => push(&mut errors, e),
        }
    }

    if params.len() > 1 && params.iter().any(ParamKind::is_event) {
        push(
            &mut errors,
            Error::new(
                sig.ident.span(),
                "an `Event` parameter must be the only payload parameter",
            ),
        );
    }

    if let Some(errors) = errors {
        return Err(errors);
    }

    Ok(BindingModel {
        method: sig.ident.clone(),
        tags: args.tags.iter().map(LitStr::value).collect(),
        mode: args.mode.unwrap_or(Mode::Default),
        tag_param,
        params,
        param_names,
        signature: format!("{}::{}({})", type_name, sig.ident, param_types.join(", ")),
    })
}

/// Error reported by `#[subscribe]` used on its own
pub fn standalone_error() -> Error {
    Error::new(
        Span::call_site(),
        "#[subscribe] only works on methods inside an impl block annotated with #[subscriber]",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote::quote;
    use syn::parse_quote;

    fn analyze(method: ImplItemFn) -> std::result::Result<BindingModel, String> {
        let attr = subscribe_attr(&method)
            .map_err(|e| e.to_string())?
            .ok_or("missing attribute")?
            .clone();
        analyze_method("Inbox", &method, &attr).map_err(|e| e.to_string())
    }

    #[test]
    fn test_unit_args() {
        assert!(parse_unit_args(quote!()).unwrap().is_none());

        let parent = parse_unit_args(quote!(extends = base::Screen)).unwrap().unwrap();
        assert_eq!(type_string(&parent), "base::Screen");

        assert!(parse_unit_args(quote!(parent = Screen)).is_err());
    }

    #[test]
    fn test_validate_impl() {
        let ok: ItemImpl = parse_quote!(impl Inbox {});
        assert!(validate_impl(&ok).is_ok());

        let generic: ItemImpl = parse_quote!(impl<T> Inbox<T> {});
        assert!(validate_impl(&generic).is_err());

        let trait_impl: ItemImpl = parse_quote!(impl Clone for Inbox { fn clone(&self) -> Self { Inbox } });
        assert!(validate_impl(&trait_impl).is_err());
    }

    #[test]
    fn test_plain_method() {
        let binding = analyze(parse_quote! {
            #[subscribe]
            fn on_refresh(&self) {}
        })
        .unwrap();

        assert!(binding.tags.is_empty());
        assert_eq!(binding.mode, Mode::Default);
        assert!(binding.params.is_empty());
        assert_eq!(binding.signature, "Inbox::on_refresh()");
    }

    #[test]
    fn test_tags_mode_and_params() {
        let binding = analyze(parse_quote! {
            #[subscribe(tag = "mail", tags = ["spam", "ham"], mode = Async)]
            fn on_mail(&self, #[tag] tag: &str, from: &str, count: u32, labels: &Vec<String>) {}
        })
        .unwrap();

        assert_eq!(binding.tags, vec!["mail", "spam", "ham"]);
        assert_eq!(binding.mode, Mode::Async);
        assert_eq!(binding.tag_param, Some(TagParam::Borrowed));
        assert_eq!(binding.param_names, vec!["&str", "u32", "&Vec<String>"]);
        assert!(matches!(
            binding.params.as_slice(),
            [ParamKind::Str, ParamKind::Value(_), ParamKind::Ref(_)]
        ));
        assert_eq!(binding.signature, "Inbox::on_mail(&str, &str, u32, &Vec<String>)");
    }

    #[test]
    fn test_mode_as_string() {
        let binding = analyze(parse_quote! {
            #[subscribe(mode = "main")]
            fn on_paint(&self, event: &Event) {}
        })
        .unwrap();
        assert_eq!(binding.mode, Mode::Main);
        assert!(matches!(binding.params.as_slice(), [ParamKind::EventRef]));
    }

    #[test]
    fn test_owned_string_parameter() {
        let binding = analyze(parse_quote! {
            #[subscribe]
            fn on_note(&self, text: String, tags: Vec<String>) {}
        })
        .unwrap();

        assert!(matches!(
            binding.params.as_slice(),
            [ParamKind::String, ParamKind::Value(_)]
        ));
        assert_eq!(binding.param_names, vec!["String", "Vec<String>"]);
    }

    #[test]
    fn test_rejections() {
        let cases: Vec<(ImplItemFn, &str)> = vec![
            (parse_quote!(#[subscribe] fn f() {}), "associated functions"),
            (parse_quote!(#[subscribe] fn f(&mut self) {}), "&self"),
            (parse_quote!(#[subscribe] fn f(self) {}), "&self"),
            (parse_quote!(#[subscribe] async fn f(&self) {}), "async"),
            (parse_quote!(#[subscribe] unsafe fn f(&self) {}), "unsafe"),
            (parse_quote!(#[subscribe] fn f<T>(&self, t: T) {}), "generic"),
            (parse_quote!(#[subscribe(tags = ["a", "a"])] fn f(&self) {}), "duplicate tag"),
            (parse_quote!(#[subscribe(mode = Ui)] fn f(&self) {}), "unknown thread mode"),
            (parse_quote!(#[subscribe(priority = 1)] fn f(&self) {}), "unknown #[subscribe] argument"),
            (parse_quote!(#[subscribe] fn f(&self, n: i32, #[tag] t: String) {}), "first parameter"),
            (parse_quote!(#[subscribe] fn f(&self, #[tag] t: u32) {}), "`String` or `&str`"),
            (parse_quote!(#[subscribe] fn f(&self, v: impl Clone) {}), "impl Trait"),
            (parse_quote!(#[subscribe] fn f(&self, v: Box<dyn Send>) {}), "trait object"),
            (parse_quote!(#[subscribe] fn f(&self, v: _) {}), "written out"),
            (parse_quote!(#[subscribe] fn f<'a>(&self, v: &'a str) {}), "generic"),
            (parse_quote!(#[subscribe] fn f(&self, v: &'static str) {}), "lifetime"),
            (parse_quote!(#[subscribe] fn f(&self, v: std::borrow::Cow<'_, str>) {}), "'static"),
            (parse_quote!(#[subscribe] fn f(&self, v: &[u8]) {}), "slice"),
            (parse_quote!(#[subscribe] fn f(&self, v: &mut u8) {}), "&mut"),
            (parse_quote!(#[subscribe] fn f(&self, e: &Event, n: u8) {}), "only payload parameter"),
        ];

        for (method, expected) in cases {
            let name = quote!(#method).to_string();
            let err = analyze(method).expect_err(&name);
            assert!(err.contains(expected), "{}: got {:?}", name, err);
        }
    }

    #[test]
    fn test_all_errors_of_a_method_are_reported() {
        let method: ImplItemFn = parse_quote! {
            #[subscribe]
            async fn f(&mut self, v: impl Clone) {}
        };
        let attr = subscribe_attr(&method).unwrap().unwrap().clone();
        let err = analyze_method("Inbox", &method, &attr).unwrap_err();
        assert_eq!(err.into_iter().count(), 3);
    }

    #[test]
    fn test_duplicate_subscribe_attr() {
        let method: ImplItemFn = parse_quote! {
            #[subscribe]
            #[subscribe(tag = "x")]
            fn f(&self) {}
        };
        assert!(subscribe_attr(&method).is_err());
    }
}
