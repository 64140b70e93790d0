//! Procedural macros for pgboot
//!
//! This crate provides the `#[migration]` attribute, which turns an
//! `async fn(tx: &mut MigrationTx) -> Result<()>` into the boxed-future
//! function shape accepted by `ProceduralMigration::new`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::spanned::Spanned;
use syn::{parse_macro_input, FnArg, ItemFn, Lifetime, ReturnType, Type};

/// Attribute macro for procedural migration steps
///
/// ```ignore
/// #[pgboot::migration]
/// async fn seed_roles(tx: &mut MigrationTx) -> pgboot::Result<()> {
///     tx.execute("INSERT INTO roles (name) VALUES ('admin')").await?;
///     Ok(())
/// }
///
/// let migration = ProceduralMigration::new(3, "seed_roles", seed_roles);
/// ```
#[proc_macro_attribute]
pub fn migration(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(
            TokenStream2::from(attr).span(),
            "#[migration] does not take arguments",
        )
        .to_compile_error()
        .into();
    }

    let input = parse_macro_input!(item as ItemFn);
    match expand_migration(input) {
        Ok(expanded) => expanded.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_migration(input: ItemFn) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;

    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.fn_token.span(), "#[migration] requires an async fn"));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new(
            sig.generics.span(),
            "#[migration] functions cannot be generic",
        ));
    }
    if sig.inputs.len() != 1 {
        return Err(syn::Error::new(
            sig.inputs.span(),
            "#[migration] functions take exactly one argument: the migration transaction",
        ));
    }

    let lifetime = Lifetime::new("'migration", sig.ident.span());

    let arg = match sig.inputs.first() {
        Some(FnArg::Typed(arg)) => arg,
        Some(other) => {
            return Err(syn::Error::new(other.span(), "#[migration] functions cannot take self"))
        }
        None => return Err(syn::Error::new(sig.inputs.span(), "missing transaction argument")),
    };

    let pat = &arg.pat;
    let tx_type = match arg.ty.as_ref() {
        Type::Reference(reference) if reference.mutability.is_some() => &reference.elem,
        other => {
            return Err(syn::Error::new(
                other.span(),
                "the transaction argument must be a mutable reference",
            ))
        }
    };

    let output = match &sig.output {
        ReturnType::Default => quote! { () },
        ReturnType::Type(_, ty) => quote! { #ty },
    };

    let name = &sig.ident;

    Ok(quote! {
        #(#attrs)*
        #vis fn #name<#lifetime>(
            #pat: &#lifetime mut #tx_type,
        ) -> ::std::pin::Pin<
            ::std::boxed::Box<
                dyn ::std::future::Future<Output = #output> + ::std::marker::Send + #lifetime,
            >,
        > {
            ::std::boxed::Box::pin(async move #block)
        }
    })
}
