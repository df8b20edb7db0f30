//! Server-rendered matrix UI.
//!
//! One page: a table with a column per output and a row per input. Header
//! cells embed each worker's own control page in an iframe (hence the
//! permissive CORS on the worker side). Checkboxes POST `/connect` bodies,
//! the arrow buttons POST the reorder endpoints, and a websocket back to
//! the router reloads the page whenever the topology changes.

use crate::server::MatrixView;

pub(crate) fn render(view: &MatrixView) -> String {
    let output_headers: String = view
        .outputs
        .iter()
        .map(|output| header_cell(&output.name, output.port))
        .collect();

    let input_rows: String = view
        .inputs
        .iter()
        .map(|input| {
            let cells: String = input
                .connected
                .iter()
                .zip(view.outputs.iter())
                .map(|(&connected, output)| {
                    matrix_cell(&input.name, &output.name, connected)
                })
                .collect();
            input_row(&input.name, input.port, &cells)
        })
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8" />
    <title>weft</title>

    <style>
      table {{
        border-collapse: collapse;
      }}

      th,
      td {{
        padding: 0px;
        border: 1px solid;
        text-align: center;
        vertical-align: middle;
      }}

      .header_iframe {{
        width: 300px;
        height: 200px;
        border: none;
      }}

      #matrix_view {{
        overflow: scroll;
        margin: 10px;
        padding: 10px;
        background-color: #E0F0F0;
        border-radius: 10px;
      }}
    </style>
  </head>

  <body>
    <div id="matrix_view">
      <table id="matrix">
        <tr>
          <th style="border: none;"></th>
          <th style="border: none;"></th>
          {output_headers}
        </tr>
        {input_rows}
      </table>
    </div>
    <script>
      let ws;

      function open_ws() {{
        ws = new WebSocket(`ws://${{window.location.host}}`);
        ws.onopen = function(ev) {{}};
        ws.onclose = function(ev) {{
          console.log(`Close: ${{ev}}`);
        }};
        ws.onmessage = function(ev) {{
          window.location.reload();
        }};
        ws.onerror = function(ev) {{
          console.log(`Error: ${{ev}}`);
          open_ws();
        }};
      }}

      open_ws();
    </script>
  </body>
</html>
"#
    )
}

/// An output column header: the worker's control page in an iframe. The
/// iframe src is assembled client-side so the page works from any hostname
/// the router is reached by.
fn header_cell(name: &str, port: u16) -> String {
    format!(
        r#"
<th>
  <iframe class="header_iframe" id="header_iframe_{name}">
  </iframe>
  <script>
    document.getElementById("header_iframe_{name}").src = `http://${{window.location.hostname}}:{port}`;
  </script>
</th>
"#
    )
}

/// One connect checkbox; the POST body is `<input>&<output>&<bool>`.
fn matrix_cell(input: &str, output: &str, connected: bool) -> String {
    let checked = if connected { "checked" } else { "" };
    format!(
        r#"
<td>
  <input
    type="checkbox"
    {checked}
    onclick="fetch('/connect', {{method: 'POST', body: `{input}&{output}&${{event.target.checked}}`}})"
  />
</td>
"#
    )
}

/// An input row: reorder buttons, the input's own header cell, then one
/// checkbox per output.
fn input_row(name: &str, port: u16, cells: &str) -> String {
    let header = header_cell(name, port);
    format!(
        r#"
<tr>
  <th>
    <table>
      <tr>
        <td style="border: none;">
          <button onclick="fetch('/bring_input_backward', {{method: 'POST', body: '{name}'}})">
            &#11165;
          </button>
        </td>
      </tr>
      <tr>
        <td style="border: none;">
          <button onclick="fetch('/bring_input_forward', {{method: 'POST', body: '{name}'}})">
            &#11167;
          </button>
        </td>
      </tr>
    </table>
  </th>
  {header}
  {cells}
</tr>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{DeviceView, InputView};

    fn view() -> MatrixView {
        MatrixView {
            outputs: vec![
                DeviceView {
                    name: "OutOne".into(),
                    port: 9001,
                },
                DeviceView {
                    name: "OutTwo".into(),
                    port: 9002,
                },
            ],
            inputs: vec![InputView {
                name: "InOne".into(),
                port: 9100,
                connected: vec![true, false],
            }],
        }
    }

    #[test]
    fn renders_headers_rows_and_reload_script() {
        let page = render(&view());
        assert!(page.contains("header_iframe_OutOne"));
        assert!(page.contains("header_iframe_OutTwo"));
        assert!(page.contains("header_iframe_InOne"));
        assert!(page.contains(":9001"));
        assert!(page.contains("new WebSocket"));
    }

    #[test]
    fn checkbox_state_follows_connections() {
        let page = render(&view());
        assert_eq!(page.matches(r#"type="checkbox""#).count(), 2);
        // Only the connected pair renders the `checked` attribute (on its
        // own line; the onclick handlers mention `.checked` differently).
        assert_eq!(page.matches("checked\n").count(), 1);
    }

    #[test]
    fn connect_bodies_name_both_devices() {
        let page = render(&view());
        assert!(page.contains("`InOne&OutOne&${event.target.checked}`"));
        assert!(page.contains("`InOne&OutTwo&${event.target.checked}`"));
    }
}
