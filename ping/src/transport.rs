use std::{future::Future, io, net::IpAddr};

use common::{
    AsyncIcmpSocket, Datagram, Family, IcmpReceiver, IcmpSender, IcmpSocket,
    Mode,
};

/// Send half of the echo transport. The engine only ever pushes fully
/// encoded ICMP bytes through it.
pub trait PingTx: Send + 'static {
    fn send(
        &mut self,
        packet: &[u8],
        dst: IpAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Receive half of the echo transport. One call yields one datagram with
/// its out-of-band hop count; the caller bounds each call with a deadline.
pub trait PingRx: Send + 'static {
    fn recv(&mut self) -> impl Future<Output = io::Result<Datagram>> + Send;
}

impl PingTx for IcmpSender {
    async fn send(&mut self, packet: &[u8], dst: IpAddr) -> io::Result<usize> {
        self.send_to(packet, dst).await
    }
}

impl PingRx for IcmpReceiver {
    async fn recv(&mut self) -> io::Result<Datagram> {
        IcmpReceiver::recv(self).await
    }
}

/// Opens the real ICMP endpoint and splits it for the engine.
pub fn open_transport(
    family: Family,
    mode: Mode,
    source: Option<IpAddr>,
    bind_interface: Option<&str>,
) -> io::Result<(IcmpSender, IcmpReceiver)> {
    let socket = IcmpSocket::new(family, mode, source, bind_interface)?;
    Ok(AsyncIcmpSocket::new(socket)?.split())
}
