use meshrpc_client::{Message, Reply, RpcError};
use serde::{Deserialize, Serialize};

pub const SERVICE: &str = "greeter";

#[derive(Debug, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HelloResponse {
    pub msg: String,
    pub node: String,
}

/// Request handler for one greeter node
#[derive(Clone, Debug)]
pub struct Greeter {
    node: String,
}

impl Greeter {
    pub fn new(node: impl Into<String>) -> Self {
        Self { node: node.into() }
    }

    pub fn handle(&self, message: &Message) -> Reply {
        match message.endpoint.as_str() {
            "Greeter.Hello" => self.hello(message),
            "Greeter.Echo" => echo(message),
            other => Reply::Error(RpcError::not_found(
                SERVICE,
                format!("unknown endpoint {}", other),
            )),
        }
    }

    fn hello(&self, message: &Message) -> Reply {
        let request: HelloRequest = match serde_json::from_slice(&message.body) {
            Ok(request) => request,
            Err(e) => return Reply::Error(RpcError::bad_request(SERVICE, e.to_string())),
        };
        let response = HelloResponse {
            msg: format!("Hello {}", request.name),
            node: self.node.clone(),
        };
        match serde_json::to_vec(&response) {
            Ok(body) => Reply::Body(body),
            Err(e) => Reply::Error(RpcError::internal_server_error(SERVICE, e.to_string())),
        }
    }
}

/// Streams each message back until the client sends `"bye"`
fn echo(message: &Message) -> Reply {
    if message.body == br#""bye""# {
        return Reply::EndOfStream;
    }
    Reply::Body(message.body.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(endpoint: &str, body: &[u8]) -> Message {
        Message {
            endpoint: endpoint.to_string(),
            body: body.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_hello_greets_by_name() {
        let greeter = Greeter::new("node-1");
        let reply = greeter.handle(&message("Greeter.Hello", br#"{"name":"John"}"#));
        let Reply::Body(body) = reply else {
            panic!("expected a body, got {:?}", reply);
        };
        let response: HelloResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.msg, "Hello John");
        assert_eq!(response.node, "node-1");
    }

    #[test]
    fn test_hello_rejects_bad_body() {
        let reply = Greeter::new("node-1").handle(&message("Greeter.Hello", b"nope"));
        assert!(matches!(reply, Reply::Error(err) if err.code == 400));
    }

    #[test]
    fn test_echo_ends_on_bye() {
        let greeter = Greeter::new("node-1");
        assert_eq!(
            greeter.handle(&message("Greeter.Echo", br#""hi""#)),
            Reply::Body(br#""hi""#.to_vec())
        );
        assert_eq!(
            greeter.handle(&message("Greeter.Echo", br#""bye""#)),
            Reply::EndOfStream
        );
    }

    #[test]
    fn test_unknown_endpoint() {
        let reply = Greeter::new("node-1").handle(&message("Greeter.Missing", b"{}"));
        assert!(matches!(reply, Reply::Error(err) if err.code == 404));
    }
}
