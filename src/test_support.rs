//! 单元测试用的本地 HTTP 桩服务。

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

/// 读取完整请求（header + Content-Length 指定的 body）。
fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).expect("read request failed");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn write_response(stream: &mut TcpStream, status_line: &str, extra_headers: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        extra_headers,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).expect("write response failed");
    stream.flush().expect("flush failed");
}

/// 只应答一次的 HTTP 服务，返回 `http://127.0.0.1:port` 与捕获到的请求文本。
pub(crate) fn serve_once(
    status_line: &str,
    extra_headers: &str,
    body: String,
) -> (String, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server failed");
    let addr = listener.local_addr().expect("read local addr failed");
    let status_line = status_line.to_string();
    let extra_headers = extra_headers.to_string();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept failed");
        let request = read_request(&mut stream);
        write_response(&mut stream, &status_line, &extra_headers, &body);
        request
    });

    (format!("http://127.0.0.1:{}", addr.port()), server)
}

/// 按顺序应答多个连接（每个连接一个请求），返回全部捕获到的请求文本。
pub(crate) fn serve_sequence(
    replies: Vec<(&str, String)>,
) -> (String, thread::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server failed");
    let addr = listener.local_addr().expect("read local addr failed");
    let replies: Vec<(String, String)> = replies
        .into_iter()
        .map(|(status, body)| (status.to_string(), body))
        .collect();

    let server = thread::spawn(move || {
        replies
            .into_iter()
            .map(|(status_line, body)| {
                let (mut stream, _) = listener.accept().expect("accept failed");
                let request = read_request(&mut stream);
                write_response(&mut stream, &status_line, "", &body);
                request
            })
            .collect()
    });

    (format!("http://127.0.0.1:{}", addr.port()), server)
}

/// 请求体（空行之后的部分）。
pub(crate) fn request_body(request: &str) -> &str {
    request.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default()
}
