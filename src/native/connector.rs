use async_tungstenite::{
    tokio::{connect_async, ConnectStream},
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderName, HeaderValue},
    },
    WebSocketStream,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    StreamExt,
};

use crate::{
    client::{ConnectionRequest, Connector, Socket},
    logging::debug,
    Error,
};

/// A [`Connector`] that opens sockets with `async-tungstenite` on the tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(docsrs, doc(cfg(feature = "async-tungstenite")))]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    type Sender = SplitSink<WebSocketStream<ConnectStream>, tungstenite::Message>;

    type Receiver = SplitStream<WebSocketStream<ConnectStream>>;

    async fn connect(
        &self,
        request: ConnectionRequest,
    ) -> Result<Socket<Self::Sender, Self::Receiver>, Error> {
        let ConnectionRequest {
            url,
            subprotocols,
            headers,
        } = request;

        let mut request = url
            .into_client_request()
            .map_err(|error| Error::Connect(error.to_string()))?;

        if !subprotocols.is_empty() {
            request.headers_mut().insert(
                SEC_WEBSOCKET_PROTOCOL,
                header_value(&subprotocols.join(", "))?,
            );
        }
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|error| Error::Connect(format!("invalid header name {name}: {error}")))?;
            request.headers_mut().append(name, header_value(&value)?);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|error| Error::Connect(error.to_string()))?;

        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        debug!("websocket connected, server selected {protocol:?}");

        let (sender, receiver) = stream.split();

        Ok(Socket {
            sender,
            receiver,
            protocol,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(value)
        .map_err(|error| Error::Connect(format!("invalid header value: {error}")))
}
