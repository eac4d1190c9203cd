// TERN STACK — NET MODULE
// The IPv4 plane:
//   packet.rs — header codec, fold-carry checksum, hello + link-state codecs
//   ip.rs     — datagram emit, validation, local delivery, forwarding
//   route.rs  — adjacency table, link-state database, Dijkstra, route table

pub mod ip;
pub mod packet;
pub mod route;
