#![forbid(unsafe_code)]

//! Deterministic sources used when the model cannot produce a compiling unit, plus the
//! scaffold files that never go through the model at all.

use crate::model::{MigrationPlan, PlannedPage};
use crate::services::PrimitiveSignature;
use std::fmt::Write as _;

pub const INDEX_HTML: &str = "index.html";
pub const APP_TSX: &str = "src/App.tsx";
pub const ROUTES_TS: &str = "src/routes.ts";

pub fn shared_path(unit_type: &str) -> String {
    format!("src/components/{unit_type}.tsx")
}

pub fn primitive_signature(unit_type: &str) -> PrimitiveSignature {
    PrimitiveSignature {
        name: unit_type.to_string(),
        import_path: format!("../components/{unit_type}"),
        exports: vec![unit_type.to_string(), format!("{unit_type}Props")],
    }
}

fn classes(design_system: &str, unit_type: &str) -> &'static str {
    if design_system != "tailwind" {
        return "";
    }
    match unit_type {
        "Button" => "inline-flex items-center rounded-md px-4 py-2 font-medium",
        "Card" => "rounded-lg border p-6 shadow-sm",
        "Footer" => "border-t py-8 text-sm",
        "Form" => "flex flex-col gap-4",
        "Header" => "flex items-center justify-between py-4",
        "Hero" => "py-24 text-center",
        "Link" => "underline-offset-4 hover:underline",
        "Navigation" => "flex gap-6",
        "Section" => "mx-auto max-w-6xl px-4 py-12",
        _ => "",
    }
}

pub fn shared_component(unit_type: &str, design_system: &str) -> String {
    let class = classes(design_system, unit_type);
    let (props, element) = match unit_type {
        "Image" => (
            "  src: string;\n  alt: string;\n  className?: string;\n",
            "<img src={src} alt={alt} className={className} loading=\"lazy\" />".to_string(),
        ),
        "Link" => (
            "  href: string;\n  children?: ReactNode;\n  className?: string;\n",
            format!("<a href={{href}} className={{`{class} ${{className}}`}}>{{children}}</a>"),
        ),
        "Button" => (
            "  children?: ReactNode;\n  className?: string;\n  onClick?: () => void;\n",
            format!(
                "<button type=\"button\" onClick={{onClick}} className={{`{class} ${{className}}`}}>{{children}}</button>"
            ),
        ),
        other => {
            let tag = match other {
                "Header" => "header",
                "Footer" => "footer",
                "Navigation" => "nav",
                "Section" | "Hero" => "section",
                "Form" => "form",
                "Card" => "article",
                _ => "div",
            };
            (
                "  children?: ReactNode;\n  className?: string;\n",
                format!("<{tag} className={{`{class} ${{className}}`}}>{{children}}</{tag}>"),
            )
        }
    };
    let params = match unit_type {
        "Image" => "{ src, alt, className = \"\" }",
        "Link" => "{ href, children, className = \"\" }",
        "Button" => "{ children, className = \"\", onClick }",
        _ => "{ children, className = \"\" }",
    };
    let mut out = String::new();
    if unit_type != "Image" {
        out.push_str("import type { ReactNode } from \"react\";\n\n");
    }
    let _ = write!(
        out,
        "export interface {unit_type}Props {{\n{props}}}\n\n\
         export function {unit_type}({params}: {unit_type}Props) {{\n  return {element};\n}}\n\n\
         export default {unit_type};\n"
    );
    out
}

/// Escapes text for use between JSX tags.
pub fn jsx_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '{' => out.push_str("&#123;"),
            '}' => out.push_str("&#125;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

fn html_attr(raw: &str) -> String {
    jsx_text(raw).replace('"', "&quot;")
}

pub fn page_component(page: &PlannedPage, primitives: &[PrimitiveSignature]) -> String {
    let has = |name: &str| primitives.iter().any(|p| p.name == name);
    let section = has("Section");

    let mut out = String::new();
    if section {
        if let Some(primitive) = primitives.iter().find(|p| p.name == "Section") {
            let _ = writeln!(
                out,
                "import {{ Section }} from \"{}\";\n",
                primitive.import_path
            );
        }
    }
    let _ = writeln!(out, "export default function {}() {{", page.component_name());
    out.push_str("  return (\n    <main>\n");
    let _ = writeln!(out, "      <h1>{}</h1>", jsx_text(&page.title));
    if !page.description.trim().is_empty() {
        let _ = writeln!(out, "      <p>{}</p>", jsx_text(&page.description));
    }
    for heading in &page.sections {
        let (open, close) = if section {
            ("<Section>", "</Section>")
        } else {
            ("<section>", "</section>")
        };
        let _ = writeln!(
            out,
            "      {open}\n        <h2>{}</h2>\n      {close}",
            jsx_text(heading)
        );
    }
    out.push_str("    </main>\n  );\n}\n");
    out
}

pub fn index_html(plan: &MigrationPlan) -> String {
    let home = plan
        .pages
        .iter()
        .find(|page| page.route == "/")
        .or_else(|| plan.pages.first());
    let title = home.map(|page| page.title.as_str()).unwrap_or("Site");
    let description = home
        .map(|page| page.description.trim())
        .filter(|d| !d.is_empty())
        .unwrap_or(title);
    format!(
        "<!doctype html>\n<html lang=\"en\">\n  <head>\n    <meta charset=\"UTF-8\" />\n    \
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\" />\n    \
         <meta name=\"description\" content=\"{}\" />\n    <title>{}</title>\n  </head>\n  \
         <body>\n    <div id=\"root\"></div>\n    <script type=\"module\" src=\"/src/main.tsx\"></script>\n  \
         </body>\n</html>\n",
        html_attr(description),
        jsx_text(title)
    )
}

pub fn routes_ts(plan: &MigrationPlan) -> String {
    let mut out = String::from(
        "export interface RouteEntry {\n  path: string;\n  title: string;\n  module: string;\n}\n\n\
         export const routes: RouteEntry[] = [\n",
    );
    for page in &plan.pages {
        let _ = writeln!(
            out,
            "  {{ path: {}, title: {}, module: \"./pages/{}\" }},",
            json_string(&page.route),
            json_string(&page.title),
            page.slug
        );
    }
    out.push_str("];\n");
    out
}

pub fn app_tsx(plan: &MigrationPlan) -> String {
    let mut out = String::from("import { BrowserRouter, Route, Routes } from \"react-router-dom\";\n");
    for page in &plan.pages {
        let _ = writeln!(
            out,
            "import {} from \"./pages/{}\";",
            page.component_name(),
            page.slug
        );
    }
    out.push_str("\nexport default function App() {\n  return (\n    <BrowserRouter>\n      <Routes>\n");
    for page in &plan.pages {
        let _ = writeln!(
            out,
            "        <Route path={} element={{<{} />}} />",
            json_string(&page.route),
            page.component_name()
        );
    }
    out.push_str("      </Routes>\n    </BrowserRouter>\n  );\n}\n");
    out
}

fn json_string(raw: &str) -> String {
    serde_json::Value::String(raw.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> PlannedPage {
        PlannedPage {
            slug: "about".to_string(),
            route: "/about".to_string(),
            title: "About {us}".to_string(),
            source_url: "https://a.example/about".to_string(),
            description: "Who we are".to_string(),
            sections: vec!["Team".to_string()],
        }
    }

    #[test]
    fn page_template_escapes_text_and_uses_section_primitive() {
        let source = page_component(&page(), &[primitive_signature("Section")]);
        assert!(source.contains("<h1>About &#123;us&#125;</h1>"));
        assert!(source.contains("import { Section } from \"../components/Section\";"));
        assert!(source.contains("export default function AboutPage()"));
        assert_eq!(source.matches("<h1>").count(), 1);

        let plain = page_component(&page(), &[]);
        assert!(plain.contains("<section>"));
        assert!(!plain.contains("import"));
    }

    #[test]
    fn image_template_requires_alt() {
        let source = shared_component("Image", "tailwind");
        assert!(source.contains("alt={alt}"));
        assert!(source.contains("export function Image("));
    }

    #[test]
    fn scaffold_lists_every_route() {
        let plan = MigrationPlan {
            design_system: "tailwind".to_string(),
            shared: Vec::new(),
            pages: vec![page()],
            fallback: true,
        };
        assert!(routes_ts(&plan).contains("{ path: \"/about\", title: \"About {us}\""));
        assert!(app_tsx(&plan).contains("<Route path=\"/about\" element={<AboutPage />} />"));
        let html = index_html(&plan);
        assert!(html.contains("<html lang=\"en\">"));
        assert!(html.contains("<meta name=\"description\" content=\"Who we are\" />"));
    }
}
