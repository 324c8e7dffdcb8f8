//! Plain-text rendering of catalog replies

use std::fmt::Write;

use super::messages::{CatalogResponse, Product};

/// Render a reply for the terminal
pub fn render_response(response: &CatalogResponse) -> String {
    match response {
        CatalogResponse::Success { data } => render_products(data),
        CatalogResponse::Error { message } => format!("Service error: {}\n", message),
    }
}

/// Render a product list with its variations
pub fn render_products(products: &[Product]) -> String {
    if products.is_empty() {
        return "No products matched.\n".to_string();
    }

    let rule = "=".repeat(50);
    let mut out = String::new();
    let _ = writeln!(out, "{}\n{:^50}\n{}", rule, "PRODUCT CATALOG", rule);

    for (i, p) in products.iter().enumerate() {
        let _ = writeln!(
            out,
            "\n{}. {} (Brand: {})",
            i + 1,
            p.nombre.to_uppercase(),
            if p.marca.is_empty() { "N/A" } else { p.marca.as_str() }
        );
        let _ = writeln!(out, "   Category: {}", p.categoria);
        let _ = writeln!(
            out,
            "   Description: {}",
            p.descripcion.as_deref().unwrap_or("-")
        );

        if p.variaciones.is_empty() {
            let _ = writeln!(out, "   (no variations available)");
            continue;
        }

        for v in &p.variaciones {
            let _ = writeln!(
                out,
                "     - Size: {:<10} | Colour: {:<15} | Price: ${:<8.2} | Stock: {}",
                v.talla.as_deref().unwrap_or("one size"),
                v.color.as_deref().unwrap_or("single colour"),
                v.precio,
                v.stock
            );
        }
    }

    let _ = writeln!(out, "\n{}", rule);
    out
}
