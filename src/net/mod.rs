mod address;
mod socket;

pub use address::InetAddress;
pub use socket::Socket;
