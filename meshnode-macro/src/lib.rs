//! # meshnode procedural macros
//!
//! ## `#[api]`
//!
//! Turns a trait into an RPC namespace. For every method it derives the wire
//! name (`namespace.lowerCamelCase`), the parameter names and the parameter
//! types, and generates:
//! - an `export` method registering all handlers with an `ApiRegistry`
//! - an implementation of the trait for `Remote`, which calls the methods on
//!   another node
//!
//! ```rust,ignore
//! #[meshnode::api(namespace = "node")]
//! pub trait NodeService {
//!     async fn get_uuid(&self, ctx: &Context) -> Result<Uuid>;
//!     async fn connect(&self, ctx: &Context, peer_address: String) -> Result<bool>;
//! }
//! ```
//!
//! Methods must have the form
//! `async fn name(&self, ctx: &Context, arg: Type, ...) -> Result<Output>`.
//! Argument types implement `RpcParam` and `Deserialize`, outputs implement
//! `Serialize` and `Deserialize`.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    FnArg, ItemTrait, LitStr, Pat, ReturnType, TraitItem, parse_macro_input, parse_quote,
};

/// Converts `snake_case` to `lowerCamelCase`, ignoring leading underscores.
fn lower_camel_case(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len());
    let mut upper = false;
    for c in ident.trim_start_matches('_').chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn default_namespace(trait_name: &str) -> String {
    let base = trait_name
        .strip_suffix("Api")
        .or_else(|| trait_name.strip_suffix("Service"))
        .filter(|base| !base.is_empty())
        .unwrap_or(trait_name);
    let mut chars = base.chars();
    chars
        .next()
        .map(|first| first.to_lowercase().chain(chars).collect())
        .unwrap_or_default()
}

/// Declares an RPC namespace.
///
/// # Panics
///
/// Panics at compile time if a method does not match
/// `async fn name(&self, ctx: &Context, ...) -> Result<T>`, has a default
/// body, or is named `export`.
#[proc_macro_attribute]
pub fn api(attr: TokenStream, input: TokenStream) -> TokenStream {
    let mut namespace: Option<String> = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("namespace") {
            namespace = Some(meta.value()?.parse::<LitStr>()?.value());
            Ok(())
        } else {
            Err(meta.error("unsupported api property, expected `namespace`"))
        }
    });
    parse_macro_input!(attr with parser);

    let mut input = parse_macro_input!(input as ItemTrait);
    let trait_ident = input.ident.clone();
    let namespace = namespace.unwrap_or_else(|| default_namespace(&trait_ident.to_string()));

    let krate = get_crate_name();
    let mut export_branches = vec![];
    let mut remote_methods = vec![];

    for item in &mut input.items {
        let TraitItem::Fn(method) = item else {
            continue;
        };
        let sig = &mut method.sig;
        let valid = sig.asyncness.is_some()
            && sig.receiver().is_some_and(|r| r.reference.is_some() && r.mutability.is_none())
            && sig.inputs.len() >= 2
            && matches!(sig.inputs[1], FnArg::Typed(_));
        let ReturnType::Type(_, output) = sig.output.clone() else {
            panic!("`{}` must return `Result<T>`", sig.ident);
        };
        if !valid {
            panic!(
                "`{}` should be in the form `async fn func(&self, ctx: &Context, ...) -> Result<T>`",
                sig.ident
            );
        }
        if method.default.is_some() {
            panic!("`{}` cannot have a default body", sig.ident);
        }
        if sig.ident == "export" {
            panic!("the function cannot be named `export`");
        }

        let method_ident = sig.ident.clone();
        let method_name = lower_camel_case(&method_ident.to_string());

        let mut arg_idents = vec![];
        let mut arg_names = vec![];
        let mut arg_types = vec![];
        for (index, arg) in sig.inputs.iter().skip(2).enumerate() {
            let FnArg::Typed(arg) = arg else {
                unreachable!("receiver is the first input");
            };
            let name = match &*arg.pat {
                Pat::Ident(pat) => pat.ident.to_string(),
                _ => panic!("arguments of `{method_ident}` must be plain identifiers"),
            };
            arg_idents.push(format_ident!("arg{}", index));
            arg_names.push(lower_camel_case(&name));
            arg_types.push((*arg.ty).clone());
        }

        // `async fn` becomes `fn -> impl Future + Send` so that handlers can
        // be spawned on a multi-threaded runtime.
        sig.asyncness = None;
        sig.output = parse_quote! {
            -> impl ::core::future::Future<Output = #output> + ::core::marker::Send
        };

        export_branches.push(quote! {
            {
                let this = self.clone();
                let descriptor = #krate::RpcMethodDescriptor::new(
                    Self::NAMESPACE,
                    #method_name,
                    ::std::vec![#(#krate::ParamDescriptor::of::<#arg_types>(#arg_names)),*],
                );
                registry.add_method(descriptor, ::std::sync::Arc::new(move |
                    ctx: #krate::Context,
                    params: ::std::vec::Vec<#krate::__private::Value>,
                | -> #krate::__private::MethodFuture {
                    let this = this.clone();
                    ::std::boxed::Box::pin(async move {
                        #[allow(unused_mut, unused_variables)]
                        let mut params = params.into_iter();
                        #(
                            let #arg_idents: #arg_types =
                                #krate::__private::from_param(#arg_names, params.next())?;
                        )*
                        let result = this.#method_ident(&ctx, #(#arg_idents),*).await?;
                        #krate::__private::to_result(result)
                    })
                }));
            }
        });

        let inputs = &sig.inputs;
        let remote_output = &sig.output;
        let wire_name = format!("{namespace}.{method_name}");
        let arg_pats: Vec<_> = sig
            .inputs
            .iter()
            .skip(2)
            .map(|arg| match arg {
                FnArg::Typed(arg) => arg.pat.clone(),
                FnArg::Receiver(_) => unreachable!("receiver is the first input"),
            })
            .collect();
        remote_methods.push(quote! {
            #[allow(unused_variables)]
            fn #method_ident(#inputs) #remote_output {
                async move {
                    let params = ::std::vec![#(#krate::__private::to_param(&#arg_pats)?),*];
                    let result: #output = self.call(#wire_name, params).await;
                    result
                }
            }
        });
    }

    let items = &input.items;
    let attrs = &input.attrs;
    let visibility = &input.vis;
    let supertraits = &input.supertraits;
    let colon = input.colon_token;
    quote! {
        #(#attrs)*
        #visibility trait #trait_ident #colon #supertraits {
            const NAMESPACE: &'static str = #namespace;

            #(#items)*

            fn export(
                self: ::std::sync::Arc<Self>,
                registry: &mut #krate::ApiRegistry,
            )
            where
                Self: 'static + Send + Sync,
            {
                #(#export_branches)*
            }
        }

        impl #trait_ident for #krate::Remote {
            #(#remote_methods)*
        }
    }
    .into()
}

/// Gets the path for importing meshnode.
///
/// Inside meshnode itself (unit and integration tests included) the crate
/// is reachable as `::meshnode` through `extern crate self as meshnode`;
/// dependents may have renamed it.
pub(crate) fn get_crate_name() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("meshnode") {
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote! { ::#ident }
        }
        _ => quote! { ::meshnode },
    }
}
