use proc_macro::TokenStream;
use proc_macro2::{Ident, Span, TokenStream as TokenStream2};
use proc_macro_crate::{FoundCrate, crate_name};
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, parse_macro_input};

#[proc_macro_derive(FormModel)]
pub fn derive_form_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    if !input.generics.params.is_empty() {
        return syn::Error::new_spanned(
            input.ident,
            "FormModel derive supports only non-generic structs",
        )
        .to_compile_error()
        .into();
    }

    let model_ident = input.ident;
    let fields_struct_ident = format_ident!("{model_ident}Fields");

    let named_fields = match input.data {
        Data::Struct(data) => match data.fields {
            Fields::Named(fields) => fields.named,
            _ => {
                return syn::Error::new(
                    Span::call_site(),
                    "FormModel derive requires a struct with named fields",
                )
                .to_compile_error()
                .into();
            }
        },
        _ => {
            return syn::Error::new(
                Span::call_site(),
                "FormModel derive is only supported on structs",
            )
            .to_compile_error()
            .into();
        }
    };

    let formix = formix_path();
    let mut fields_methods = Vec::new();
    let mut definitions = Vec::new();
    let mut readers = Vec::new();

    for field in named_fields {
        let Some(field_ident) = field.ident else {
            continue;
        };
        let field_ty = field.ty;
        let field_name = field_ident.to_string();

        fields_methods.push(quote! {
            pub fn #field_ident(&self) -> #formix::form::Field<#field_ty> {
                #formix::form::Field::new(#field_name)
            }
        });

        definitions.push(quote! {
            #formix::form::FieldDefinition::builder(&fields.#field_ident())
                .initial(::core::clone::Clone::clone(&self.#field_ident))
                .build()
        });

        readers.push(quote! {
            #field_ident: state.read::<#field_ty>(#field_name)?
        });
    }

    quote! {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct #fields_struct_ident;

        impl #fields_struct_ident {
            #(#fields_methods)*
        }

        impl #formix::form::FormModel for #model_ident {
            type Fields = #fields_struct_ident;

            fn fields() -> Self::Fields {
                #fields_struct_ident
            }

            fn definitions(&self) -> ::std::vec::Vec<#formix::form::FieldDefinition> {
                let fields = #fields_struct_ident;
                ::std::vec![#(#definitions),*]
            }

            fn from_state(
                state: &#formix::form::FormState,
            ) -> #formix::form::FormResult<Self> {
                ::core::result::Result::Ok(Self {
                    #(#readers),*
                })
            }
        }
    }
    .into()
}

fn formix_path() -> TokenStream2 {
    match crate_name("formix") {
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, Span::call_site());
            quote!(::#ident)
        }
        Ok(FoundCrate::Itself) => quote!(crate),
        Err(_) => quote!(::formix),
    }
}
