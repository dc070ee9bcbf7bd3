use catsync_core::TargetProduct;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::warn;

use crate::FeedError;

const IMAGE_SLOTS: usize = 5;

type XmlWriter = Writer<Vec<u8>>;

/// Render the marketplace feed. Product order is kept as given.
pub fn render_target_feed(products: &[TargetProduct]) -> Result<String, FeedError> {
    let mut writer = Writer::new_with_indent(Vec::with_capacity(products.len() * 1024 + 64), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("Products")))?;
    for product in products {
        render_product(&mut writer, product)?;
    }
    writer.write_event(Event::End(BytesEnd::new("Products")))?;

    let mut out = String::from_utf8_lossy(&writer.into_inner()).into_owned();
    out.push('\n');
    Ok(out)
}

fn render_product(writer: &mut XmlWriter, product: &TargetProduct) -> Result<(), FeedError> {
    writer.write_event(Event::Start(BytesStart::new("Product")))?;
    element(writer, "ProductCode", &product.id)?;
    element(writer, "ProductName", &product.title)?;
    element(writer, "Quantity", &product.stock.to_string())?;
    element(writer, "Price", &format!("{:.2}", product.price))?;
    element(writer, "Currency", &product.currency)?;
    element(writer, "TaxRate", &product.tax_rate)?;
    element(writer, "Barcode", &product.barcode)?;
    cdata_element(writer, "Category", &product.category)?;
    cdata_element(writer, "Description", &product.description)?;
    if product.images.len() > IMAGE_SLOTS {
        warn!(
            product_id = %product.id,
            images = product.images.len(),
            slots = IMAGE_SLOTS,
            "feed has fewer image slots than the product has images; extra images are not published"
        );
    }
    for slot in 0..IMAGE_SLOTS {
        let url = product.images.get(slot).map(String::as_str).unwrap_or_default();
        element(writer, &format!("Image{}", slot + 1), url)?;
    }
    element(writer, "Brand", &product.brand)?;

    if !product.bullets.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("Bullets")))?;
        for bullet in &product.bullets {
            element(writer, "Bullet", bullet)?;
        }
        writer.write_event(Event::End(BytesEnd::new("Bullets")))?;
    }

    if !product.variants.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("Variants")))?;
        for variant in &product.variants {
            writer.write_event(Event::Start(BytesStart::new("Variant")))?;
            element(writer, "VariantCode", &variant.code)?;
            element(writer, "Barcode", &variant.barcode)?;
            element(writer, "VariantQuantity", &variant.stock.to_string())?;
            element(writer, "VariantPrice", &format!("{:.2}", variant.price))?;
            if let Some(color) = &variant.key.color {
                element(writer, "VariantName1", "Renk")?;
                element(writer, "VariantValue1", color)?;
            }
            if let Some(size) = &variant.key.size {
                element(writer, "VariantName2", "Beden")?;
                element(writer, "VariantValue2", size)?;
            }
            writer.write_event(Event::End(BytesEnd::new("Variant")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("Variants")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("Product")))?;
    Ok(())
}

fn element(writer: &mut XmlWriter, name: &str, value: &str) -> Result<(), FeedError> {
    if value.is_empty() {
        writer.write_event(Event::Empty(BytesStart::new(name)))?;
    } else {
        writer.write_event(Event::Start(BytesStart::new(name)))?;
        writer.write_event(Event::Text(BytesText::new(value)))?;
        writer.write_event(Event::End(BytesEnd::new(name)))?;
    }
    Ok(())
}

// "]]>" cannot appear inside a CDATA section, so it is split across adjacent sections.
fn cdata_element(writer: &mut XmlWriter, name: &str, value: &str) -> Result<(), FeedError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    let pieces: Vec<&str> = value.split("]]>").collect();
    let last = pieces.len() - 1;
    for (i, piece) in pieces.iter().enumerate() {
        let head = if i > 0 { ">" } else { "" };
        let tail = if i < last { "]]" } else { "" };
        let section = format!("{head}{piece}{tail}");
        writer.write_event(Event::CData(BytesCData::new(section.as_str())))?;
    }
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_source_feed;
    use catsync_core::{TargetVariant, VariantKey};

    fn product() -> TargetProduct {
        TargetProduct {
            id: "SD-1".into(),
            title: "Premium-AB12 | Bot & Çizme <yeni>".into(),
            brand: "Solederva".into(),
            category: "Ayakkabı > Comfort > Bot".into(),
            price: 1299.9,
            stock: 12,
            currency: "TL".into(),
            tax_rate: "20".into(),
            barcode: "2199000000001".into(),
            description: "<p>a]]>b</p>".into(),
            images: vec!["https://cdn.example.com/a.jpg?rnd=x&w=1".into()],
            bullets: vec!["Renk: Siyah".into()],
            variants: vec![TargetVariant {
                code: "SD-1_1_38".into(),
                barcode: "2199000000002".into(),
                key: VariantKey::new(Some("Siyah".into()), Some("38".into())),
                price: 1299.9,
                stock: 12,
            }],
        }
    }

    #[test]
    fn renders_escaped_fields_and_variants() {
        let xml = render_target_feed(&[product()]).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<ProductName>Premium-AB12 | Bot &amp; Çizme &lt;yeni&gt;</ProductName>"));
        assert!(xml.contains("<Price>1299.90</Price>"));
        assert!(xml.contains("<Image1>https://cdn.example.com/a.jpg?rnd=x&amp;w=1</Image1>"));
        assert!(xml.contains("<Image2/>"));
        assert!(xml.contains("<Category><![CDATA[Ayakkabı > Comfort > Bot]]></Category>"));
        assert!(xml.contains("<VariantValue2>38</VariantValue2>"));
        assert!(xml.contains("<Bullet>Renk: Siyah</Bullet>"));
    }

    #[test]
    fn output_is_well_formed_and_keeps_order() {
        let mut second = product();
        second.id = "SD-2".into();
        second.variants.clear();
        let xml = render_target_feed(&[product(), second]).unwrap();

        // The rendered feed has the same shape the reader expects, so it must at least parse.
        let wrapped = xml.replace("<Products>", "<root>").replace("</Products>", "</root>");
        assert!(parse_source_feed(wrapped.as_bytes()).is_ok());

        let first = xml.find("<ProductCode>SD-1</ProductCode>").unwrap();
        let second = xml.find("<ProductCode>SD-2</ProductCode>").unwrap();
        assert!(first < second);
        assert_eq!(xml.matches("<Variants>").count(), 1);
    }

    #[test]
    fn cdata_terminator_in_description_is_split() {
        let xml = render_target_feed(&[product()]).unwrap();
        assert!(xml.contains("<Description><![CDATA[<p>a]]]]><![CDATA[>b</p>]]></Description>"));

        let wrapped = xml.replace("<Products>", "<root>").replace("</Products>", "</root>");
        let mut reader = quick_xml::Reader::from_str(&wrapped);
        let mut description = String::new();
        let mut inside = false;
        loop {
            match reader.read_event().unwrap() {
                Event::Start(e) if e.name().as_ref() == b"Description" => inside = true,
                Event::End(e) if e.name().as_ref() == b"Description" => inside = false,
                Event::CData(c) if inside => description.push_str(std::str::from_utf8(&c).unwrap()),
                Event::Eof => break,
                _ => {}
            }
        }
        assert_eq!(description, "<p>a]]>b</p>");
    }

    #[test]
    fn images_beyond_the_fixed_slots_are_not_rendered() {
        let mut many = product();
        many.images = (1..=7).map(|i| format!("https://cdn.example.com/{i}.jpg")).collect();
        let xml = render_target_feed(&[many]).unwrap();
        assert!(xml.contains("<Image5>https://cdn.example.com/5.jpg</Image5>"));
        assert!(!xml.contains("Image6"));
        assert!(!xml.contains("6.jpg"));
    }
}
