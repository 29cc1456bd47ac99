use std::net::SocketAddr;
use zss_client::{Operation, TransportError};

const SCHEME: &str = "tcp://";

/// 解析 `tcp://host:port` 形式的地址，取第一个可用的解析结果。
pub(crate) async fn resolve(address: &str) -> Result<SocketAddr, TransportError> {
    let authority = address
        .strip_prefix(SCHEME)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| TransportError::InvalidAddress(address.to_owned()))?;
    tokio::net::lookup_host(authority)
        .await
        .map_err(|err| TransportError::io(Operation::CONNECT, err))?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(address.to_owned()))
}

/// 将套接字地址格式化为可供端点连接的地址串。
pub(crate) fn to_uri(addr: SocketAddr) -> String {
    format!("{SCHEME}{addr}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_literal_socket_address() {
        let addr = resolve("tcp://127.0.0.1:7777").await.unwrap();
        assert_eq!(addr, "127.0.0.1:7777".parse::<SocketAddr>().unwrap());
        assert_eq!(to_uri(addr), "tcp://127.0.0.1:7777");
    }

    #[tokio::test]
    async fn rejects_foreign_scheme_and_missing_authority() {
        for address in ["ipc:///tmp/broker", "tcp://", "127.0.0.1:7777"] {
            let err = resolve(address).await.unwrap_err();
            assert_eq!(err.code(), "zss.transport.invalid_address", "{address}");
        }
    }
}
