use proc_macro::TokenStream;
use proc_macro_error::{abort, proc_macro_error};
use quote::{format_ident, quote};
use syn::{parse_macro_input, punctuated::Punctuated, ItemFn, Lit, Meta, Token};

const NAME: &str = "name";

/// Register a function as a resumable work function.
///
/// ```ignore
/// #[taskforge::work_function(name = "render_video")]
/// fn render(ctx: &TaskContext, kwargs: &Kwargs) -> anyhow::Result<Value> { ... }
/// ```
///
/// The key defaults to the function name. `WorkRegistry::with_registered()`
/// picks up every annotated function linked into the binary.
#[proc_macro_attribute]
#[proc_macro_error]
pub fn work_function(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input_fn = parse_macro_input!(item as ItemFn);
    let attr_args =
        syn::parse::Parser::parse2(Punctuated::<Meta, Token![,]>::parse_terminated, attr.into())
            .unwrap_or_else(|e| abort!(e.span(), "Failed to parse work_function attributes: {}", e));

    let fn_name = &input_fn.sig.ident;
    let mut name = fn_name.to_string();

    for meta in &attr_args {
        match meta {
            Meta::NameValue(nv) if nv.path.is_ident(NAME) => {
                if let syn::Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(lit) = &expr_lit.lit {
                        name = lit.value();
                        continue;
                    }
                }
                abort!(nv.value, "Expected a string literal for name");
            }
            other => abort!(other, "Unknown work_function attribute"),
        }
    }

    if input_fn.sig.asyncness.is_some() {
        abort!(input_fn.sig, "work_function cannot be async; tasks run on their own thread");
    }
    if input_fn.sig.inputs.len() != 2 {
        abort!(
            input_fn.sig.inputs,
            "work_function expects (ctx: &TaskContext, kwargs: &Kwargs)"
        );
    }

    let registration = format_ident!("__WORK_FUNCTION_{}", fn_name.to_string().to_uppercase());

    let expanded = quote! {
        #input_fn

        #[::taskforge::linkme::distributed_slice(::taskforge::tasks::WORK_FUNCTIONS)]
        #[linkme(crate = ::taskforge::linkme)]
        #[allow(non_upper_case_globals)]
        static #registration: ::taskforge::tasks::WorkRegistration =
            ::taskforge::tasks::WorkRegistration {
                name: #name,
                function: #fn_name,
            };
    };

    TokenStream::from(expanded)
}
