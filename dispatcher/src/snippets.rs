//! In-page JavaScript snippets: the device probe injected into served
//! HTML and the redirect stub used when device signals are too thin for
//! a plain 302.

/// Enrichment endpoint the snippets post to.
pub const ENRICH_PATH: &str = "/t/enrich";

/// Probe that reports screen/DPR/GPU/timezone/model signals for the
/// given impression. Best effort: failures must never affect the page.
pub fn device_probe(impression_id: &str) -> String {
    let impression_id = escape_js(impression_id);
    format!(
        r#"<script>(function(){{try{{var d={{impressionId:"{impression_id}",screen:screen.width+"x"+screen.height,dpr:window.devicePixelRatio||1,tz:Intl.DateTimeFormat().resolvedOptions().timeZone||""}};try{{var c=document.createElement("canvas"),g=c.getContext("webgl")||c.getContext("experimental-webgl");if(g){{var x=g.getExtension("WEBGL_debug_renderer_info");if(x)d.gpu=g.getParameter(x.UNMASKED_RENDERER_WEBGL);}}}}catch(e){{}}
var fin=function(){{try{{navigator.sendBeacon("{enrich}",JSON.stringify(d));}}catch(e){{}}}};
if(navigator.userAgentData&&navigator.userAgentData.getHighEntropyValues){{navigator.userAgentData.getHighEntropyValues(["model","platformVersion","architecture"]).then(function(h){{d.model=h.model||"";d.osVersion=h.platformVersion||"";d.arch=h.architecture||"";fin();}},fin);}}else{{fin();}}}}catch(e){{}}}})();</script>"#,
        enrich = ENRICH_PATH,
    )
}

/// HTML stub that fires the probe and then navigates. Used in place of
/// a server-side 302 when the context is signal-poor, so the redirect
/// opportunistically captures what the headers could not.
pub fn redirect_stub(location: &str, impression_id: &str) -> String {
    let probe = device_probe(impression_id);
    let location = escape_js(location);
    format!(
        r#"<!DOCTYPE html><html><head><meta name="robots" content="noindex"></head><body>{probe}<script>location.href="{location}";</script></body></html>"#
    )
}

/// Embed-mode delivery: a redirect rendered as JavaScript.
pub fn embed_redirect(location: &str) -> String {
    format!(
        "window.location.replace(\"{}\");\n",
        escape_js(location)
    )
}

/// Embed-mode delivery: document content rendered as JavaScript.
pub fn embed_document(html: &str) -> String {
    format!("document.open();document.write(\"{}\");document.close();\n", escape_js(html))
}

fn escape_js(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            c => out.push(c),
        }
    }
    out
}
