//! Code generation for `#[subscriber]`
//!
//! For
//!
//! ```rust,ignore
//! #[subscriber]
//! impl Inbox {
//!     #[subscribe(tag = "mail")]
//!     fn on_mail(&self, from: &str) {}
//! }
//! ```
//!
//! the output is the impl block with helper attributes stripped, a hidden
//! inherent impl holding one accept and one invoke function per binding, and
//! `impl ::tagbus::SubscribeRegister for Inbox` listing the bindings.

use crate::model::{BindingModel, ParamKind, Shape, TagParam, UnitModel, type_string};
use crate::parse::{
    SUBSCRIBE_ATTR, TAG_ATTR, analyze_method, is_attr, parse_unit_args, subscribe_attr, validate_impl,
};
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Error, FnArg, ImplItem, ItemImpl, Result};

pub fn subscriber_impl(attr: TokenStream2, item: TokenStream2) -> TokenStream2 {
    let mut input: ItemImpl = match syn::parse2(item) {
        Ok(input) => input,
        Err(e) => return e.to_compile_error(),
    };

    let (unit, errors) = match analyze(attr, &input) {
        Ok(result) => result,
        Err(e) => {
            strip_helper_attrs(&mut input);
            let error = e.to_compile_error();
            return quote! {
                #input
                #error
            };
        }
    };

    strip_helper_attrs(&mut input);
    let generated = generate(&unit);
    let errors = errors.iter().map(Error::to_compile_error);

    quote! {
        #input
        #generated
        #(#errors)*
    }
}

/// Collect the unit; invalid methods are returned as errors next to it
fn analyze(attr: TokenStream2, input: &ItemImpl) -> Result<(UnitModel, Vec<Error>)> {
    let parent = parse_unit_args(attr)?;
    validate_impl(input)?;

    let type_name = type_string(&input.self_ty);
    let mut bindings = Vec::new();
    let mut errors = Vec::new();

    for item in &input.items {
        let ImplItem::Fn(method) = item else {
            continue;
        };
        let attr = match subscribe_attr(method) {
            Ok(Some(attr)) => attr,
            Ok(None) => continue,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        match analyze_method(&type_name, method, attr) {
            Ok(binding) => bindings.push(binding),
            Err(e) => errors.push(e),
        }
    }

    Ok((
        UnitModel {
            self_ty: (*input.self_ty).clone(),
            type_name,
            parent,
            bindings,
        },
        errors,
    ))
}

fn strip_helper_attrs(input: &mut ItemImpl) {
    for item in &mut input.items {
        let ImplItem::Fn(method) = item else {
            continue;
        };
        method.attrs.retain(|attr| !is_attr(attr, SUBSCRIBE_ATTR));
        for arg in &mut method.sig.inputs {
            if let FnArg::Typed(pat_type) = arg {
                pat_type.attrs.retain(|attr| !is_attr(attr, TAG_ATTR));
            }
        }
    }
}

fn accept_fn(binding: &BindingModel) -> TokenStream2 {
    let name = format_ident!("__tagbus_accept_{}", binding.method);

    let body = match binding.shape() {
        Shape::Empty => quote!(__event.payload_len() == 0),
        Shape::Event => quote!(true),
        Shape::Positional(len) => {
            let checks = binding.params.iter().enumerate().map(|(index, param)| match param {
                ParamKind::Value(ty) | ParamKind::Ref(ty) => quote!(__payload.is::<#ty>(#index)),
                ParamKind::Str | ParamKind::String => quote!(::tagbus::is_str(__payload, #index)),
                ParamKind::EventRef | ParamKind::EventOwned => quote!(true),
            });
            quote! {
                __event.with_payload(|__payload| __payload.len() == #len #(&& #checks)*)
            }
        }
    };

    quote! {
        #[doc(hidden)]
        #[allow(unused_variables)]
        fn #name(__event: &::tagbus::Event) -> bool {
            #body
        }
    }
}

fn invoke_fn(binding: &BindingModel) -> TokenStream2 {
    let name = format_ident!("__tagbus_invoke_{}", binding.method);
    let method = &binding.method;
    let signature = &binding.signature;

    let tag_arg = binding.tag_param.map(|kind| match kind {
        TagParam::Owned => quote!(__event.tag()),
        TagParam::Borrowed => quote!(&__event.tag()),
    });

    let payload_args = binding.params.iter().enumerate().map(|(index, param)| match param {
        ParamKind::Value(ty) => quote!(::tagbus::arg::<#ty>(&__payload, #index, #signature)?),
        ParamKind::Ref(ty) => quote!(::tagbus::arg_ref::<#ty>(&__payload, #index, #signature)?),
        ParamKind::Str => quote!(::tagbus::arg_str(&__payload, #index, #signature)?),
        ParamKind::String => quote! {
            ::std::borrow::ToOwned::to_owned(::tagbus::arg_str(&__payload, #index, #signature)?)
        },
        ParamKind::EventRef => quote!(__event),
        ParamKind::EventOwned => quote!(::core::clone::Clone::clone(__event)),
    });
    let args = tag_arg.into_iter().chain(payload_args);

    let payload = matches!(binding.shape(), Shape::Positional(_))
        .then(|| quote!(let __payload = __event.payload();));

    quote! {
        #[doc(hidden)]
        fn #name(&self, __event: &::tagbus::Event) -> ::core::result::Result<(), ::tagbus::HandlerError> {
            #payload
            ::tagbus::IntoHandlerResult::into_handler_result(
                self.#method(#(#args),*),
                #signature,
            )
        }
    }
}

fn descriptor(unit: &UnitModel, binding: &BindingModel) -> TokenStream2 {
    let subscriber = &unit.type_name;
    let method = binding.method.to_string();
    let signature = &binding.signature;
    let tags = &binding.tags;
    let mode = binding.mode;
    let params = &binding.param_names;
    let tag_param = binding.tag_param.is_some();
    let shape = match binding.shape() {
        Shape::Empty => quote!(::tagbus::ParamShape::Empty),
        Shape::Event => quote!(::tagbus::ParamShape::Event),
        Shape::Positional(len) => quote!(::tagbus::ParamShape::Positional(#len)),
    };
    let accept = format_ident!("__tagbus_accept_{}", binding.method);
    let invoke = format_ident!("__tagbus_invoke_{}", binding.method);

    quote! {
        ::tagbus::MethodBinding {
            descriptor: &::tagbus::BindingDescriptor {
                subscriber: #subscriber,
                method: #method,
                signature: #signature,
                tags: &[#(#tags),*],
                mode: #mode,
                params: &[#(#params),*],
                tag_param: #tag_param,
                shape: #shape,
            },
            accept: Self::#accept,
            invoke: Self::#invoke,
        }
    }
}

pub fn generate(unit: &UnitModel) -> TokenStream2 {
    let self_ty = &unit.self_ty;

    let helpers: Vec<TokenStream2> = unit
        .bindings
        .iter()
        .flat_map(|binding| [accept_fn(binding), invoke_fn(binding)])
        .collect();
    let helper_impl = (!helpers.is_empty()).then(|| {
        quote! {
            #[allow(non_snake_case)]
            impl #self_ty {
                #(#helpers)*
            }
        }
    });

    let descriptors = unit.bindings.iter().map(|binding| descriptor(unit, binding));

    let inherited = unit.parent.as_ref().map(|parent| {
        quote! {
            fn register_bindings<__T: ::core::marker::Send + ::core::marker::Sync + 'static>(
                bus: &::tagbus::EventBus,
                target: &::std::sync::Arc<__T>,
                project: ::tagbus::Projection<__T, Self>,
            ) -> ::core::result::Result<(), ::tagbus::BusError> {
                <#parent as ::tagbus::SubscribeRegister>::register_bindings(
                    bus,
                    target,
                    project.then(<Self as ::core::convert::AsRef<#parent>>::as_ref),
                )?;
                ::tagbus::register_declared(bus, target, &project)
            }

            fn collect_bindings(out: &mut ::std::vec::Vec<&'static ::tagbus::BindingDescriptor>) {
                <#parent as ::tagbus::SubscribeRegister>::collect_bindings(out);
                out.extend(Self::BINDINGS.iter().map(|binding| binding.descriptor));
            }
        }
    });

    quote! {
        #helper_impl

        impl ::tagbus::SubscribeRegister for #self_ty {
            const BINDINGS: &'static [::tagbus::MethodBinding<Self>] = &[
                #(#descriptors),*
            ];

            #inherited
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(attr: TokenStream2, item: TokenStream2) -> String {
        subscriber_impl(attr, item).to_string()
    }

    #[test]
    fn test_strips_helper_attributes() {
        let out = expand(
            quote!(),
            quote! {
                impl Inbox {
                    #[subscribe(tag = "mail")]
                    fn on_mail(&self, #[tag] tag: String, from: &str) {}

                    fn helper(&self) {}
                }
            },
        );

        assert!(!out.contains("# [subscribe"));
        assert!(!out.contains("# [tag]"));
        assert!(out.contains("fn helper"));
        assert!(out.contains("impl :: tagbus :: SubscribeRegister for Inbox"));
        assert!(out.contains("__tagbus_accept_on_mail"));
        assert!(out.contains("\"Inbox::on_mail(String, &str)\""));
        assert!(out.contains("__event . tag ()"));
        assert!(out.contains(":: tagbus :: arg_str"));
    }

    #[test]
    fn test_accept_shapes() {
        let out = expand(
            quote!(),
            quote! {
                impl Panel {
                    #[subscribe]
                    fn on_refresh(&self) {}

                    #[subscribe(tag = "any")]
                    fn on_any(&self, event: &Event) {}

                    #[subscribe(tag = "triple")]
                    fn on_triple(&self, n: i32, flag: bool, text: String) {}
                }
            },
        );

        assert!(out.contains("__event . payload_len () == 0"));
        assert!(out.contains("ParamShape :: Event"));
        assert!(out.contains("__payload . len () == 3usize"));
        assert!(out.contains("__payload . is :: < i32 > (0usize)"));
        assert!(out.contains(":: tagbus :: is_str (__payload , 2usize)"));
        assert!(out.contains(":: std :: borrow :: ToOwned :: to_owned (:: tagbus :: arg_str (& __payload , 2usize"));
        assert!(out.contains(":: tagbus :: arg :: < bool > (& __payload , 1usize"));
    }

    #[test]
    fn test_invalid_methods_do_not_block_valid_ones() {
        let out = expand(
            quote!(),
            quote! {
                impl Inbox {
                    #[subscribe]
                    fn good(&self) {}

                    #[subscribe]
                    fn bad(&mut self) {}
                }
            },
        );

        assert!(out.contains("__tagbus_invoke_good"));
        assert!(!out.contains("__tagbus_invoke_bad"));
        assert!(out.contains("compile_error"));
        assert!(out.contains("fn bad"));
    }

    #[test]
    fn test_extends_delegates_to_parent() {
        let out = expand(
            quote!(extends = Base),
            quote! {
                impl Child {
                    #[subscribe(mode = Async)]
                    fn on_child(&self) {}
                }
            },
        );

        assert!(out.contains("< Base as :: tagbus :: SubscribeRegister > :: register_bindings"));
        assert!(out.contains(":: core :: convert :: AsRef < Base >"));
        assert!(out.contains(":: tagbus :: ThreadMode :: Async"));
    }

    #[test]
    fn test_impl_level_error() {
        let out = expand(
            quote!(),
            quote! {
                impl<T> Inbox<T> {
                    #[subscribe]
                    fn on_x(&self) {}
                }
            },
        );

        assert!(out.contains("compile_error"));
        assert!(!out.contains("# [subscribe]"));
        assert!(!out.contains("SubscribeRegister"));
    }
}
