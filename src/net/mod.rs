// Transport framework: packet buffers, reference-counted xprts over the
// event loops, and the server lifecycle that owns them.

pub mod pbuff;
pub mod server;
pub mod xprt;

pub use pbuff::PBuff;
pub use server::{
    create_server, Server, ServerDtor, SERVER_DESTROYED, SERVER_INITING, SERVER_RUNNING,
    SERVER_STOPPED, SERVER_STOPPING,
};
pub use xprt::{
    create_xprt, Xprt, XprtOps, SHUT_RD, SHUT_RDWR, SHUT_WR, XPRT_OPT_NONBLOCK, XPRT_RDREADY,
    XPRT_ST_CLOSED, XPRT_ST_CONNECTED, XPRT_ST_CONNREFUSED, XPRT_ST_DESTROYED,
    XPRT_ST_INITIALIZING, XPRT_ST_OPENED, XPRT_ST_SHUT_RD, XPRT_ST_SHUT_WR, XPRT_TCPCLNT,
    XPRT_TCPSERV, XPRT_WRREADY,
};
