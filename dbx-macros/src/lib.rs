extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Ident, Span};
use quote::quote;
use syn::meta::parser;
use syn::parse::Parser;
use syn::{parse_macro_input, Attribute, Data, DeriveInput, Fields, GenericArgument, LitStr, PathArguments, Type};

/// 绑定结构体与数据表，生成 `DbModel` 实现与关联常量。
/// 使用示例：
/// #[dbx::model(table = "user", pk = "uid")]
/// #[derive(Serialize, Deserialize)]
/// struct User { uid: i64, gid: i64, name: String, #[serde(rename = "createDate")] create_date: NaiveDateTime }
/// 生成：
/// impl User { const TABLE_NAME: &str = "user"; const PRIMARY_KEY: &str = "uid"; }
/// impl dbx::db::model::DbModel for User { ... }
/// 列名取字段名，遵循 `#[serde(rename)]` 与 `#[serde(rename_all)]`，跳过 `#[serde(skip)]`。
/// 可选：`auto_increment = false`，`crate_path = "::dbx"`（默认）。
#[proc_macro_attribute]
pub fn model(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut table_name: Option<String> = None;
    let mut pk: String = "id".to_string();
    let mut auto_increment: bool = true;
    let mut crate_path: String = "::dbx".to_string();

    let parser = parser(|meta| {
        if meta.path.is_ident("table") || meta.path.is_ident("table_name") {
            let s: LitStr = meta.value()?.parse()?;
            table_name = Some(s.value());
            Ok(())
        } else if meta.path.is_ident("pk") {
            let s: LitStr = meta.value()?.parse()?;
            pk = s.value();
            Ok(())
        } else if meta.path.is_ident("auto_increment") {
            let b: syn::LitBool = meta.value()?.parse()?;
            auto_increment = b.value();
            Ok(())
        } else if meta.path.is_ident("crate_path") {
            let s: LitStr = meta.value()?.parse()?;
            crate_path = s.value();
            Ok(())
        } else {
            Err(meta.error("#[model] 未知参数，可用: table, pk, auto_increment, crate_path"))
        }
    });

    if let Err(err) = parser.parse(args) {
        return err.to_compile_error().into();
    }

    let input_ast = parse_macro_input!(input as DeriveInput);

    let fields_named = match &input_ast.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(named) => named,
            Fields::Unnamed(_) | Fields::Unit => {
                return syn::Error::new_spanned(&input_ast.ident, "#[model] 仅支持具名字段结构体")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new_spanned(&input_ast.ident, "#[model] 仅能应用于结构体")
                .to_compile_error()
                .into();
        }
    };

    let ident = input_ast.ident.clone();
    let (impl_generics, ty_generics, where_clause) = input_ast.generics.split_for_impl();

    let table = match table_name {
        Some(t) => t,
        None => {
            return syn::Error::new_spanned(&ident, "#[model] 需要提供 table，例如 table = \"my_table\"")
                .to_compile_error()
                .into();
        }
    };

    let path = match syn::parse_str::<syn::Path>(&crate_path) {
        Ok(p) => p,
        Err(e) => {
            return syn::Error::new_spanned(&ident, format!("#[model] crate_path 解析失败: {}", e))
                .to_compile_error()
                .into();
        }
    };

    let rename_all = match serde_attr(&input_ast.attrs) {
        Ok(s) => s.rename_all,
        Err(e) => return e.to_compile_error().into(),
    };

    let mut columns: Vec<(String, &'static str)> = Vec::new();
    for field in fields_named.named.iter() {
        let attr = match serde_attr(&field.attrs) {
            Ok(a) => a,
            Err(e) => return e.to_compile_error().into(),
        };
        if attr.skip {
            continue;
        }
        let name = match attr.rename {
            Some(n) => n,
            None => {
                let raw = field
                    .ident
                    .as_ref()
                    .map(|i| i.to_string())
                    .unwrap_or_default();
                let raw = raw.trim_start_matches("r#").to_string();
                match &rename_all {
                    Some(rule) => match apply_rename_all(rule, &raw) {
                        Some(n) => n,
                        None => {
                            return syn::Error::new_spanned(&ident, format!("不支持的 rename_all: {}", rule))
                                .to_compile_error()
                                .into();
                        }
                    },
                    None => raw,
                }
            }
        };
        columns.push((name, col_type(&field.ty)));
    }

    if !columns.iter().any(|(c, _)| c.eq_ignore_ascii_case(&pk)) {
        return syn::Error::new_spanned(
            &ident,
            format!("#[model] 主键列 '{}' 不存在于结构体 {} 中", pk, ident),
        )
        .to_compile_error()
        .into();
    }

    let col_defs = columns.iter().map(|(name, ty)| {
        let ty = Ident::new(ty, Span::call_site());
        quote! {
            #path::db::model::ColumnDef {
                name: #name,
                ty: #path::db::model::ColType::#ty,
            }
        }
    });

    let expanded = quote! {
        #input_ast

        impl #impl_generics #ident #ty_generics #where_clause {
            pub const TABLE_NAME: &'static str = #table;
            pub const PRIMARY_KEY: &'static str = #pk;
        }

        impl #impl_generics #path::db::model::DbModel for #ident #ty_generics #where_clause {
            fn table_name() -> &'static str {
                Self::TABLE_NAME
            }
            fn primary_key() -> &'static str {
                Self::PRIMARY_KEY
            }
            fn columns() -> &'static [#path::db::model::ColumnDef] {
                const COLS: &[#path::db::model::ColumnDef] = &[#(#col_defs),*];
                COLS
            }
            fn auto_increment() -> bool {
                #auto_increment
            }
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct SerdeAttr {
    rename: Option<String>,
    rename_all: Option<String>,
    skip: bool,
}

/// 读取 `#[serde(...)]` 中与列名相关的键，其余键忽略
fn serde_attr(attrs: &[Attribute]) -> syn::Result<SerdeAttr> {
    let mut out = SerdeAttr::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("serde")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") && meta.input.peek(syn::Token![=]) {
                let s: LitStr = meta.value()?.parse()?;
                out.rename = Some(s.value());
            } else if meta.path.is_ident("rename_all") && meta.input.peek(syn::Token![=]) {
                let s: LitStr = meta.value()?.parse()?;
                out.rename_all = Some(s.value());
            } else if meta.path.is_ident("skip") {
                out.skip = true;
            } else if meta.input.peek(syn::Token![=]) {
                let _: syn::Expr = meta.value()?.parse()?;
            } else if meta.input.peek(syn::token::Paren) {
                let _content;
                syn::parenthesized!(_content in meta.input);
            }
            Ok(())
        })?;
    }
    Ok(out)
}

fn apply_rename_all(rule: &str, field: &str) -> Option<String> {
    let words: Vec<&str> = field.split('_').filter(|w| !w.is_empty()).collect();
    let capitalize = |w: &str| {
        let mut c = w.chars();
        match c.next() {
            Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
            None => String::new(),
        }
    };
    Some(match rule {
        "lowercase" => field.to_lowercase(),
        "UPPERCASE" => field.to_uppercase(),
        "snake_case" => field.to_string(),
        "SCREAMING_SNAKE_CASE" => field.to_uppercase(),
        "kebab-case" => field.replace('_', "-"),
        "PascalCase" => words.iter().map(|w| capitalize(*w)).collect(),
        "camelCase" => {
            let mut s = String::new();
            for (i, w) in words.iter().enumerate() {
                if i == 0 {
                    s.push_str(w);
                } else {
                    s.push_str(&capitalize(*w));
                }
            }
            s
        }
        _ => return None,
    })
}

/// Rust 类型到列类型；`Option<T>` 取 `T`
fn col_type(ty: &Type) -> &'static str {
    match ty {
        Type::Reference(r) => col_type(&r.elem),
        Type::Group(g) => col_type(&g.elem),
        Type::Paren(p) => col_type(&p.elem),
        Type::Path(tp) => {
            let Some(seg) = tp.path.segments.last() else {
                return "Json";
            };
            let name = seg.ident.to_string();
            if name == "Option" {
                if let PathArguments::AngleBracketed(args) = &seg.arguments {
                    if let Some(GenericArgument::Type(inner)) = args.args.first() {
                        return col_type(inner);
                    }
                }
                return "Json";
            }
            match name.as_str() {
                "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64"
                | "u128" | "usize" => "Int64",
                "f32" | "f64" => "Float64",
                "bool" => "Bool",
                "String" | "str" => "Text",
                "NaiveDateTime" | "DateTime" | "NaiveDate" => "Timestamp",
                _ => "Json",
            }
        }
        _ => "Json",
    }
}
