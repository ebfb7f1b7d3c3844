//! Synthesizes the downloadable report artifact: an HTML body wrapped in
//! the legacy Word envelope, served as `application/msword`. Known field
//! prefixes and the header line get bolded, everything else is carried
//! over verbatim.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::report::parse_date;

pub const MIME_TYPE: &str = "application/msword";

const LINE_STYLE: &str = "font-family:Calibri,sans-serif;font-size:11.0pt;";

static FIELD_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(Visita n°\d+:|Riassunto visita:|Obiettivo prox visita:|Prox visita entro:)")
        .expect("valid field prefix regex")
});

/// `Report DD-MM-YYYY.doc`, from the report's date.
pub fn file_name(date: &str) -> Result<String, time::error::Parse> {
    let date = parse_date(date)?;

    Ok(format!(
        "Report {:02}-{:02}-{}.doc",
        date.day(),
        u8::from(date.month()),
        date.year()
    ))
}

fn format_line(line: &str) -> String {
    if line.trim().is_empty() {
        return format!("<p style=\"margin:0;\"><span style=\"{LINE_STYLE}\">&nbsp;</span></p>");
    }

    if line.starts_with("Report del") {
        return format!(
            "<p style=\"margin:0;\"><span style=\"{LINE_STYLE}\"><b>{line}</b></span></p>"
        );
    }

    if let Some(found) = FIELD_PREFIX_RE.find(line) {
        let (prefix, rest) = line.split_at(found.end());
        return format!(
            "<p style=\"margin:0;\"><span style=\"{LINE_STYLE}\"><b>{prefix}</b>{rest}</span></p>"
        );
    }

    format!("<p style=\"margin:0;\"><span style=\"{LINE_STYLE}\">{line}</span></p>")
}

pub fn render(text: &str) -> String {
    let content: String = text.split('\n').map(format_line).collect();

    format!(
        "<html xmlns:o='urn:schemas-microsoft-com:office:office' \
         xmlns:w='urn:schemas-microsoft-com:office:word' \
         xmlns='http://www.w3.org/TR/REC-html40'>\
         <head><meta charset='utf-8'><title>Report</title></head>\
         <body><div>{content}</div></body></html>"
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn file_name_is_day_month_year() {
        assert_eq!(file_name("2024-05-02").unwrap(), "Report 02-05-2024.doc");
        assert_eq!(
            file_name("2024-12-31T23:00:00.000Z").unwrap(),
            "Report 31-12-2024.doc"
        );
        assert!(file_name("un giorno").is_err());
    }

    #[test]
    fn header_line_is_fully_bold() {
        let line = format_line("Report del 02/05/2024");
        assert!(line.contains("<b>Report del 02/05/2024</b>"));
    }

    #[test]
    fn field_prefixes_are_bolded() {
        let line = format_line("Visita n°12: colloquio con il titolare");
        assert!(line.contains("<b>Visita n°12:</b> colloquio con il titolare"));

        let line = format_line("Riassunto visita: tutto bene");
        assert!(line.contains("<b>Riassunto visita:</b> tutto bene"));

        let line = format_line("Obiettivo prox visita: ordine");
        assert!(line.contains("<b>Obiettivo prox visita:</b> ordine"));

        let line = format_line("Prox visita entro: giugno");
        assert!(line.contains("<b>Prox visita entro:</b> giugno"));
    }

    #[test]
    fn unknown_prefixes_stay_plain() {
        let line = format_line("Visita n: senza numero");
        assert!(!line.contains("<b>"));

        let line = format_line("Cliente: Bar Centrale");
        assert!(!line.contains("<b>"));
    }

    #[test]
    fn blank_lines_keep_their_paragraph() {
        assert!(format_line("").contains("&nbsp;"));
        assert!(format_line("   ").contains("&nbsp;"));
    }

    #[test]
    fn render_wraps_the_office_envelope() {
        let html = render("Report del 02/05/2024\n\nVisita n°1: avvio");

        assert!(html.starts_with("<html xmlns:o="));
        assert!(html.contains("urn:schemas-microsoft-com:office:word"));
        assert!(html.contains("<b>Report del 02/05/2024</b>"));
        assert!(html.contains("&nbsp;"));
        assert!(html.contains("<b>Visita n°1:</b> avvio"));
        assert!(html.ends_with("</div></body></html>"));
    }
}
